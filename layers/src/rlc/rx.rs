//! RLC receive entity
//!
//! Reassembles UM/AM segments inside a bounded SN window. Anything below the
//! window, or already delivered, is dropped without error.

use super::{EntityKey, SegmentFlags, SegmentHeader};
use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};
use common::types::DeliveryPath;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// Rx entity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RxStats {
    /// PDUs handed to the entity
    pub received: u64,
    /// SDUs reassembled
    pub delivered: u64,
    /// Stale, duplicate or already delivered PDUs
    pub dropped: u64,
    /// Partial SDUs given up on
    pub abandoned: u64,
}

impl RxStats {
    fn absorb(&mut self, other: RxStats) {
        self.received += other.received;
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.abandoned += other.abandoned;
    }
}

#[derive(Debug, Clone, Default)]
struct Partial {
    segments: BTreeMap<u32, Bytes>,
    /// SDU length, known once the LAST segment arrived
    total: Option<u32>,
}

impl Partial {
    fn insert(&mut self, offset: u32, data: Bytes, last: bool) -> bool {
        if self.segments.contains_key(&offset) {
            return false;
        }
        if last {
            self.total = Some(offset + data.len() as u32);
        }
        self.segments.insert(offset, data);
        true
    }

    fn is_complete(&self) -> bool {
        let Some(total) = self.total else {
            return false;
        };
        let mut covered = 0u32;
        for (offset, data) in &self.segments {
            if *offset > covered {
                return false;
            }
            covered = covered.max(offset + data.len() as u32);
        }
        covered >= total
    }

    fn assemble(&self) -> Bytes {
        let mut sdu = BytesMut::with_capacity(self.total.unwrap_or(0) as usize);
        let mut cursor = 0u32;
        for (offset, data) in &self.segments {
            let end = offset + data.len() as u32;
            if end <= cursor {
                continue;
            }
            sdu.put_slice(&data[(cursor - offset) as usize..]);
            cursor = end;
        }
        sdu.freeze()
    }
}

/// Exported reassembly state, handed to the entity replacing this one
#[derive(Debug, Clone, Default)]
pub struct RxState {
    rx_next: u32,
    pending: BTreeMap<u32, Partial>,
    delivered: BTreeSet<u32>,
    stats: RxStats,
}

impl RxState {
    /// Lower window edge
    pub fn rx_next(&self) -> u32 {
        self.rx_next
    }

    /// SNs with partial SDUs
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Per (originating peer, LCID) receive entity
#[derive(Debug)]
pub struct RlcRxEntity {
    key: EntityKey,
    path: DeliveryPath,
    window: u32,
    state: RxState,
}

impl RlcRxEntity {
    pub fn new(key: EntityKey, path: DeliveryPath, window: u32) -> Self {
        debug!("Creating RLC Rx entity for {} ({:?})", key, path);
        Self { key, path, window, state: RxState::default() }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn path(&self) -> DeliveryPath {
        self.path
    }

    pub fn stats(&self) -> RxStats {
        self.state.stats
    }

    /// Lower window edge
    pub fn rx_next(&self) -> u32 {
        self.state.rx_next
    }

    /// Handle one PDU; returns the SDU it completes, if any
    pub fn receive(&mut self, pdu: Bytes) -> Result<Option<Bytes>, LayerError> {
        let (header, data) = SegmentHeader::parse(&pdu)?;
        if u32::try_from(data.len()).ok().and_then(|len| header.offset.checked_add(len)).is_none() {
            return Err(LayerError::InvalidPdu(format!(
                "RLC segment at offset {} with {} bytes exceeds the SDU range",
                header.offset,
                data.len()
            )));
        }
        self.state.stats.received += 1;
        let sn = header.sn;

        if sn < self.state.rx_next || self.state.delivered.contains(&sn) {
            self.state.stats.dropped += 1;
            trace!("{}: SN {} outside window or already delivered, dropped", self.key, sn);
            return Ok(None);
        }

        if sn >= self.state.rx_next.saturating_add(self.window) {
            self.slide_window(sn.saturating_sub(self.window.saturating_sub(1)));
        }

        let partial = self.state.pending.entry(sn).or_default();
        if !partial.insert(header.offset, data, header.flags.contains(SegmentFlags::LAST)) {
            self.state.stats.dropped += 1;
            trace!("{}: duplicate segment SN {} offset {}", self.key, sn, header.offset);
            return Ok(None);
        }

        if !partial.is_complete() {
            return Ok(None);
        }
        Ok(self.complete(sn))
    }

    fn complete(&mut self, sn: u32) -> Option<Bytes> {
        let partial = self.state.pending.remove(&sn)?;
        let sdu = partial.assemble();
        self.state.delivered.insert(sn);
        self.state.stats.delivered += 1;
        self.advance_lower_edge();
        trace!("{}: reassembled SN {} ({} bytes)", self.key, sn, sdu.len());
        Some(sdu)
    }

    fn slide_window(&mut self, new_next: u32) {
        let behind: Vec<u32> = self.state.pending.range(..new_next).map(|(sn, _)| *sn).collect();
        for sn in &behind {
            self.state.pending.remove(sn);
        }
        if !behind.is_empty() {
            warn!("{}: window moved to {}, abandoned {} partial SDUs", self.key, new_next, behind.len());
        }
        self.state.stats.abandoned += behind.len() as u64;
        self.state.rx_next = new_next;
        self.advance_lower_edge();
    }

    fn advance_lower_edge(&mut self) {
        let rx_next = self.state.rx_next;
        self.state.delivered.retain(|sn| *sn >= rx_next);
        while self.state.delivered.contains(&self.state.rx_next) {
            // the top SN stays recorded as delivered, the edge cannot pass it
            let Some(next) = self.state.rx_next.checked_add(1) else {
                break;
            };
            self.state.delivered.remove(&self.state.rx_next);
            self.state.rx_next = next;
        }
    }

    /// Export the reassembly state, optionally dropping partial SDUs
    pub fn into_state(self, clear_buffer: bool) -> RxState {
        let mut state = self.state;
        if clear_buffer && !state.pending.is_empty() {
            debug!("{}: cleared {} partial SDUs", self.key, state.pending.len());
            state.stats.abandoned += state.pending.len() as u64;
            state.pending.clear();
        }
        state
    }

    /// Merge the state of the entity this one replaces
    ///
    /// Returns the SDUs the merge completed, in SN order. SNs the prior
    /// entity already delivered stay delivered.
    pub fn reconcile_after_switch(&mut self, prior: RxState) -> Vec<Bytes> {
        let state = &mut self.state;
        state.rx_next = state.rx_next.max(prior.rx_next);
        state.delivered.extend(prior.delivered);
        state.stats.absorb(prior.stats);

        for (sn, partial) in prior.pending {
            if sn < state.rx_next || state.delivered.contains(&sn) {
                continue;
            }
            let merged = state.pending.entry(sn).or_default();
            for (offset, data) in partial.segments {
                merged.segments.entry(offset).or_insert(data);
            }
            merged.total = merged.total.or(partial.total);
        }
        self.advance_lower_edge();

        let ready: Vec<u32> =
            self.state.pending.iter().filter(|(_, p)| p.is_complete()).map(|(sn, _)| *sn).collect();
        let completed: Vec<Bytes> = ready.into_iter().filter_map(|sn| self.complete(sn)).collect();
        debug!(
            "{}: reconciled after switch, rx_next={} pending={} completed={}",
            self.key,
            self.state.rx_next,
            self.state.pending.len(),
            completed.len()
        );
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlc::RlcTxEntity;
    use common::types::{Lcid, NodeId, RlcMode};

    fn rx(window: u32) -> RlcRxEntity {
        RlcRxEntity::new(EntityKey::new(NodeId(1), Lcid(1)), DeliveryPath::Direct, window)
    }

    fn segments(sn: u32, sdu: &'static [u8], max_pdu_size: usize) -> Vec<Bytes> {
        let mut tx = RlcTxEntity::new(EntityKey::new(NodeId(2), Lcid(1)), RlcMode::Um, DeliveryPath::Direct, 64, max_pdu_size);
        assert!(tx.admit(sn, Bytes::from_static(sdu), vec![]));
        tx.pull(64).into_iter().map(|p| p.bytes).collect()
    }

    fn whole(sn: u32, sdu: &'static [u8]) -> Bytes {
        segments(sn, sdu, 100).remove(0)
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let mut rx = rx(16);
        let parts = segments(0, b"hello world", 13);
        assert_eq!(parts.len(), 3);

        assert_eq!(rx.receive(parts[2].clone()).unwrap(), None);
        assert_eq!(rx.receive(parts[0].clone()).unwrap(), None);
        assert_eq!(rx.receive(parts[1].clone()).unwrap(), Some(Bytes::from_static(b"hello world")));
        assert_eq!(rx.rx_next(), 1);
    }

    #[test]
    fn test_duplicate_after_delivery_is_dropped_once() {
        let mut rx = rx(16);
        let pdu = whole(0, b"abc");
        assert_eq!(rx.receive(pdu.clone()).unwrap(), Some(Bytes::from_static(b"abc")));
        let before = rx.stats().dropped;
        assert_eq!(rx.receive(pdu).unwrap(), None);
        assert_eq!(rx.stats().dropped, before + 1);
        assert_eq!(rx.stats().delivered, 1);
    }

    #[test]
    fn test_duplicate_segment_of_pending_sdu() {
        let mut rx = rx(16);
        let parts = segments(3, b"0123456789", 13);
        rx.receive(parts[0].clone()).unwrap();
        rx.receive(parts[0].clone()).unwrap();
        assert_eq!(rx.stats().dropped, 1);
    }

    #[test]
    fn test_window_slides_and_abandons() {
        let mut rx = rx(4);
        let parts = segments(1, b"0123456789", 13);
        rx.receive(parts[0].clone()).unwrap();

        // SN 6 pushes the window to [3, 7)
        assert!(rx.receive(whole(6, b"x")).unwrap().is_some());
        assert_eq!(rx.rx_next(), 3);
        assert_eq!(rx.stats().abandoned, 1);

        // the rest of SN 1 is now stale
        assert_eq!(rx.receive(parts[1].clone()).unwrap(), None);
        assert_eq!(rx.stats().dropped, 1);
    }

    #[test]
    fn test_lower_edge_follows_contiguous_deliveries() {
        let mut rx = rx(16);
        rx.receive(whole(1, b"b")).unwrap();
        assert_eq!(rx.rx_next(), 0);
        rx.receive(whole(0, b"a")).unwrap();
        assert_eq!(rx.rx_next(), 2);
    }

    #[test]
    fn test_malformed_pdu() {
        let mut rx = rx(16);
        assert!(matches!(rx.receive(Bytes::from_static(&[0x01])), Err(LayerError::InvalidPdu(_))));
    }

    #[test]
    fn test_top_sn_is_delivered_once() {
        let mut rx = rx(8);
        let flags = SegmentFlags::FIRST | SegmentFlags::LAST;
        let pdu = SegmentHeader { flags, sn: u32::MAX, offset: 0 }.encode(b"edge");

        assert_eq!(rx.receive(pdu.clone()).unwrap(), Some(Bytes::from_static(b"edge")));
        assert_eq!(rx.rx_next(), u32::MAX - 7);
        assert_eq!(rx.receive(pdu).unwrap(), None);
        assert_eq!(rx.stats().delivered, 1);
        assert_eq!(rx.stats().dropped, 1);
    }

    #[test]
    fn test_segment_past_sdu_range_is_rejected() {
        let mut rx = rx(8);
        let pdu = SegmentHeader { flags: SegmentFlags::LAST, sn: 0, offset: u32::MAX - 1 }.encode(b"abc");

        assert!(matches!(rx.receive(pdu), Err(LayerError::InvalidPdu(_))));
        assert_eq!(rx.stats().received, 0);
        assert_eq!(rx.into_state(false).pending(), 0);
    }

    #[test]
    fn test_reconcile_merges_partials_and_history() {
        let parts = segments(2, b"0123456789", 13);
        let mut old = rx(16);
        old.receive(whole(0, b"a")).unwrap();
        old.receive(parts[0].clone()).unwrap();

        let mut fresh = RlcRxEntity::new(EntityKey::new(NodeId(1), Lcid(1)), DeliveryPath::Infrastructure, 16);
        fresh.receive(parts[1].clone()).unwrap();
        fresh.receive(parts[2].clone()).unwrap();

        let completed = fresh.reconcile_after_switch(old.into_state(false));
        assert_eq!(completed, vec![Bytes::from_static(b"0123456789")]);

        // SN 0 was delivered before the switch
        assert_eq!(fresh.receive(whole(0, b"a")).unwrap(), None);
        assert_eq!(fresh.stats().delivered, 2);
    }

    #[test]
    fn test_reconcile_with_cleared_buffer() {
        let parts = segments(0, b"0123456789", 13);
        let mut old = rx(16);
        old.receive(parts[0].clone()).unwrap();
        let state = old.into_state(true);
        assert_eq!(state.pending(), 0);

        let mut fresh = rx(16);
        assert!(fresh.reconcile_after_switch(state).is_empty());
        assert_eq!(fresh.stats().abandoned, 1);
    }
}
