//! RLC transmit entity

use super::{header_overhead, EntityKey, SegmentFlags, SegmentHeader};
use bytes::Bytes;
use common::types::{DeliveryPath, NodeId, RlcMode};
use common::utils::segment_count;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Admission state of a Tx entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting SDUs
    Normal,
    /// Refusing SDUs while the queue drains for a mode switch
    Holding,
}

/// PDU waiting for a transmission opportunity
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPdu {
    pub bytes: Bytes,
    /// Final recipients of the SDU the PDU belongs to
    pub recipients: Vec<NodeId>,
}

/// Tx entity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxStats {
    pub admitted: u64,
    pub refused: u64,
    pub overflow: u64,
    pub pulled: u64,
    pub discarded: u64,
}

/// Per (next hop, LCID) transmit buffer
#[derive(Debug)]
pub struct RlcTxEntity {
    key: EntityKey,
    mode: RlcMode,
    path: DeliveryPath,
    capacity: usize,
    data_size: usize,
    queue: VecDeque<OutboundPdu>,
    state: TxState,
    stats: TxStats,
}

impl RlcTxEntity {
    /// Create an entity; `max_pdu_size` must exceed the mode's header overhead
    pub fn new(key: EntityKey, mode: RlcMode, path: DeliveryPath, capacity: usize, max_pdu_size: usize) -> Self {
        debug!("Creating RLC Tx entity for {} ({:?}, {:?})", key, mode, path);
        Self {
            key,
            mode,
            path,
            capacity,
            data_size: max_pdu_size.saturating_sub(header_overhead(mode)),
            queue: VecDeque::new(),
            state: TxState::Normal,
            stats: TxStats::default(),
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn mode(&self) -> RlcMode {
        self.mode
    }

    pub fn path(&self) -> DeliveryPath {
        self.path
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    /// PDUs waiting for transmission
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Buffer an SDU, segmenting it if the mode requires
    ///
    /// Returns false when the entity is holding or the SDU does not fit.
    pub fn admit(&mut self, sn: u32, sdu: Bytes, recipients: Vec<NodeId>) -> bool {
        if self.state == TxState::Holding {
            self.stats.refused += 1;
            trace!("{}: holding, refused SN {}", self.key, sn);
            return false;
        }

        let segments = match self.mode {
            RlcMode::Tm => 1,
            RlcMode::Um | RlcMode::Am => segment_count(sdu.len(), self.data_size),
        };
        if segments == 0 || self.queue.len() + segments > self.capacity {
            self.stats.overflow += 1;
            warn!(
                "{}: queue full ({}/{} PDUs), dropping SN {} ({} bytes)",
                self.key,
                self.queue.len(),
                self.capacity,
                sn,
                sdu.len()
            );
            return false;
        }

        match self.mode {
            RlcMode::Tm => self.queue.push_back(OutboundPdu { bytes: sdu, recipients }),
            RlcMode::Um | RlcMode::Am => self.segment(sn, &sdu, &recipients, segments),
        }
        self.stats.admitted += 1;
        trace!("{}: admitted SN {} as {} PDUs", self.key, sn, segments);
        true
    }

    fn segment(&mut self, sn: u32, sdu: &Bytes, recipients: &[NodeId], segments: usize) {
        for index in 0..segments {
            let start = index * self.data_size;
            let end = (start + self.data_size).min(sdu.len());
            let mut flags = SegmentFlags::empty();
            if index == 0 {
                flags |= SegmentFlags::FIRST;
            }
            if index + 1 == segments {
                flags |= SegmentFlags::LAST;
                if self.mode == RlcMode::Am {
                    flags |= SegmentFlags::POLL;
                }
            }
            let header = SegmentHeader { flags, sn, offset: start as u32 };
            self.queue.push_back(OutboundPdu {
                bytes: header.encode(&sdu[start..end]),
                recipients: recipients.to_vec(),
            });
        }
    }

    /// Emit up to `max` PDUs in FIFO order
    pub fn pull(&mut self, max: usize) -> Vec<OutboundPdu> {
        let count = max.min(self.queue.len());
        let pdus: Vec<_> = self.queue.drain(..count).collect();
        self.stats.pulled += pdus.len() as u64;
        pdus
    }

    /// Stop admitting new SDUs; queued PDUs keep flowing
    pub fn begin_draining(&mut self) {
        if self.state != TxState::Holding {
            debug!("{}: holding with {} PDUs queued", self.key, self.queue.len());
        }
        self.state = TxState::Holding;
    }

    /// Holding and still carrying PDUs
    pub fn is_draining(&self) -> bool {
        self.state == TxState::Holding && !self.queue.is_empty()
    }

    /// Admit again; the queue is left untouched
    pub fn resume(&mut self) {
        self.state = TxState::Normal;
    }

    /// Drop everything queued, returns the number of PDUs dropped
    pub fn discard_all(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.stats.discarded += dropped as u64;
        if dropped > 0 {
            debug!("{}: discarded {} PDUs", self.key, dropped);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlc::SEGMENT_HEADER_LEN;
    use common::types::Lcid;

    fn entity(mode: RlcMode, capacity: usize, max_pdu_size: usize) -> RlcTxEntity {
        RlcTxEntity::new(
            EntityKey::new(NodeId(2), Lcid(1)),
            mode,
            DeliveryPath::Direct,
            capacity,
            max_pdu_size,
        )
    }

    fn sdu(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>())
    }

    #[test]
    fn test_holding_refuses_until_resumed() {
        let mut tx = entity(RlcMode::Um, 16, 100);
        for sn in 0..3 {
            assert!(tx.admit(sn, sdu(10), vec![NodeId(2)]));
        }
        tx.begin_draining();
        assert!(tx.is_draining());
        assert!(!tx.admit(3, sdu(10), vec![NodeId(2)]));
        assert_eq!(tx.stats().refused, 1);

        assert_eq!(tx.pull(2).len(), 2);
        assert!(tx.is_draining());
        assert_eq!(tx.pull(5).len(), 1);
        assert!(!tx.is_draining());

        // drained but still holding
        assert!(!tx.admit(4, sdu(10), vec![NodeId(2)]));
        tx.resume();
        assert!(tx.admit(5, sdu(10), vec![NodeId(2)]));
    }

    #[test]
    fn test_um_segmentation() {
        let mut tx = entity(RlcMode::Um, 16, SEGMENT_HEADER_LEN + 4);
        assert!(tx.admit(9, sdu(10), vec![NodeId(2)]));
        let pdus = tx.pull(10);
        assert_eq!(pdus.len(), 3);

        let headers: Vec<_> = pdus.iter().map(|p| SegmentHeader::parse(&p.bytes).unwrap()).collect();
        assert_eq!(headers[0].0.flags, SegmentFlags::FIRST);
        assert_eq!(headers[1].0.flags, SegmentFlags::empty());
        assert_eq!(headers[2].0.flags, SegmentFlags::LAST);
        assert_eq!(headers.iter().map(|(h, _)| h.offset).collect::<Vec<_>>(), vec![0, 4, 8]);
        assert_eq!(headers[2].1.len(), 2);
        assert!(headers.iter().all(|(h, _)| h.sn == 9));
    }

    #[test]
    fn test_am_polls_on_last_segment() {
        let mut tx = entity(RlcMode::Am, 16, 100);
        tx.admit(0, Bytes::new(), vec![]);
        let (header, data) = SegmentHeader::parse(&tx.pull(1)[0].bytes).unwrap();
        assert_eq!(header.flags, SegmentFlags::FIRST | SegmentFlags::LAST | SegmentFlags::POLL);
        assert!(data.is_empty());
    }

    #[test]
    fn test_tm_passes_sdu_through() {
        let mut tx = entity(RlcMode::Tm, 4, 100);
        let payload = sdu(300);
        assert!(tx.admit(0, payload.clone(), vec![NodeId(1)]));
        assert_eq!(tx.pull(1), vec![OutboundPdu { bytes: payload, recipients: vec![NodeId(1)] }]);
    }

    #[test]
    fn test_capacity_counted_in_pdus() {
        let mut tx = entity(RlcMode::Um, 3, SEGMENT_HEADER_LEN + 10);
        assert!(tx.admit(0, sdu(20), vec![]));
        assert!(!tx.admit(1, sdu(20), vec![]));
        assert_eq!(tx.stats().overflow, 1);
        assert!(tx.admit(2, sdu(5), vec![]));
        assert_eq!(tx.queued(), 3);

        assert_eq!(tx.discard_all(), 3);
        assert_eq!(tx.stats().discarded, 3);
        assert_eq!(tx.queued(), 0);
    }
}
