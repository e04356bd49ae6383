//! Mode switch coordinator
//!
//! Moves the traffic exchanged with one peer between delivery paths. While a
//! peer is switching its Tx entities hold (they keep emitting what they
//! already queued but admit nothing) and new SDUs for the peer wait in a
//! bounded per-peer queue. The switch completes once nothing is draining, or
//! immediately when the buffers are cleared; the waiting SDUs are then
//! flushed, in order, onto the new path.

use super::PeerIndex;
use crate::rlc::{EntityKey, RlcTxEntity};
use bytes::Bytes;
use common::types::{DeliveryPath, Lcid, NodeId, RlcMode};
use interfaces::{DeliveryInterface, EventId, LayerEvent};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, trace, warn};

/// SDU admitted for a switching peer, waiting for the new path
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredSdu {
    pub lcid: Lcid,
    pub sn: u32,
    pub mode: RlcMode,
    pub sdu: Bytes,
    pub recipients: Vec<NodeId>,
}

/// Per-peer switch phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPhase {
    Active,
    Switching { target: DeliveryPath, drain_check: Option<EventId> },
    Switched,
}

/// Result of a completed switch, applied by the multiplexer
#[derive(Debug)]
pub struct SwitchCompletion {
    pub peer: NodeId,
    pub path: DeliveryPath,
    /// SDUs to flush onto the new path, oldest first
    pub deferred: Vec<DeferredSdu>,
}

/// Coordinator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwitchStats {
    pub started: u64,
    pub completed: u64,
    pub deferred: u64,
    pub deferred_overflow: u64,
    /// PDUs discarded by buffer-clearing switches
    pub discarded: u64,
}

#[derive(Debug)]
struct PeerSwitch {
    phase: SwitchPhase,
    deferred: VecDeque<DeferredSdu>,
}

/// Per-node mode switch state machine
#[derive(Debug)]
pub struct ModeSwitchCoordinator {
    peers: BTreeMap<NodeId, PeerSwitch>,
    paths: BTreeMap<NodeId, DeliveryPath>,
    capacity: usize,
    drain_check_interval_us: u64,
    stats: SwitchStats,
}

impl ModeSwitchCoordinator {
    pub fn new(capacity: usize, drain_check_interval_us: u64) -> Self {
        Self {
            peers: BTreeMap::new(),
            paths: BTreeMap::new(),
            capacity,
            drain_check_interval_us,
            stats: SwitchStats::default(),
        }
    }

    /// Current path towards a direct-capable peer
    pub fn current_path(&self, peer: NodeId) -> DeliveryPath {
        self.paths.get(&peer).copied().unwrap_or(DeliveryPath::Direct)
    }

    pub fn phase(&self, peer: NodeId) -> SwitchPhase {
        self.peers.get(&peer).map(|p| p.phase).unwrap_or(SwitchPhase::Active)
    }

    pub fn is_switching(&self, peer: NodeId) -> bool {
        matches!(self.phase(peer), SwitchPhase::Switching { .. })
    }

    /// Peers with a switch in progress
    pub fn switching_peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, p)| matches!(p.phase, SwitchPhase::Switching { .. }))
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn stats(&self) -> SwitchStats {
        self.stats
    }

    /// SDUs waiting for a peer's switch to finish
    pub fn deferred_len(&self, peer: NodeId) -> usize {
        self.peers.get(&peer).map(|p| p.deferred.len()).unwrap_or(0)
    }

    /// True while the peer is switching and one of its entities drains
    pub fn is_draining(&self, peer: NodeId, index: &PeerIndex, tx: &BTreeMap<EntityKey, RlcTxEntity>) -> bool {
        self.is_switching(peer) && any_draining(peer, index, tx)
    }

    /// Start a switch of the peer's traffic to `new_path`
    ///
    /// A switch already in progress is superseded: its pending drain check is
    /// cancelled and the new target wins.
    pub fn notify(
        &mut self,
        peer: NodeId,
        new_path: DeliveryPath,
        clear_buffer: bool,
        index: &PeerIndex,
        tx: &mut BTreeMap<EntityKey, RlcTxEntity>,
        delivery: &mut dyn DeliveryInterface,
    ) -> Option<SwitchCompletion> {
        let state = self.peers.entry(peer).or_insert_with(|| PeerSwitch {
            phase: SwitchPhase::Active,
            deferred: VecDeque::new(),
        });
        if let SwitchPhase::Switching { target, drain_check: Some(id) } = state.phase {
            delivery.cancel(id);
            debug!("Peer {}: switch to {:?} superseded by {:?}", peer, target, new_path);
        }
        state.phase = SwitchPhase::Switching { target: new_path, drain_check: None };
        self.stats.started += 1;
        info!(
            "Peer {}: switching from {:?} to {:?} (clear_buffer={})",
            peer,
            self.current_path(peer),
            new_path,
            clear_buffer
        );

        let keys = index.entities(peer);
        for key in &keys {
            if let Some(entity) = tx.get_mut(key) {
                entity.begin_draining();
            }
        }

        if clear_buffer {
            let mut discarded = 0;
            for key in &keys {
                if let Some(entity) = tx.get_mut(key) {
                    discarded += entity.discard_all();
                }
            }
            self.stats.discarded += discarded as u64;
            debug!("Peer {}: discarded {} queued PDUs", peer, discarded);
            return Some(self.complete(peer, new_path, index, tx));
        }

        self.reevaluate(peer, index, tx, delivery)
    }

    /// Re-check a switching peer; completes the switch once nothing drains
    pub fn reevaluate(
        &mut self,
        peer: NodeId,
        index: &PeerIndex,
        tx: &mut BTreeMap<EntityKey, RlcTxEntity>,
        delivery: &mut dyn DeliveryInterface,
    ) -> Option<SwitchCompletion> {
        let SwitchPhase::Switching { target, drain_check } = self.phase(peer) else {
            return None;
        };

        if any_draining(peer, index, tx) {
            if drain_check.is_none() {
                let at = delivery.now().plus_micros(self.drain_check_interval_us);
                let id = delivery.schedule_at(at, LayerEvent::DrainCheck { peer });
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.phase = SwitchPhase::Switching { target, drain_check: Some(id) };
                }
                trace!("Peer {}: still draining, drain check {} at {}", peer, id, at);
            }
            return None;
        }

        if let Some(id) = drain_check {
            delivery.cancel(id);
        }
        Some(self.complete(peer, target, index, tx))
    }

    /// Handle a fired drain check
    pub fn on_drain_check(
        &mut self,
        peer: NodeId,
        index: &PeerIndex,
        tx: &mut BTreeMap<EntityKey, RlcTxEntity>,
        delivery: &mut dyn DeliveryInterface,
    ) -> Option<SwitchCompletion> {
        let Some(state) = self.peers.get_mut(&peer) else {
            trace!("Stale drain check for peer {}", peer);
            return None;
        };
        let SwitchPhase::Switching { target, .. } = state.phase else {
            trace!("Stale drain check for peer {}", peer);
            return None;
        };
        // the check that fired is spent
        state.phase = SwitchPhase::Switching { target, drain_check: None };
        self.reevaluate(peer, index, tx, delivery)
    }

    /// Queue an SDU for a switching peer; false when the queue is full
    pub fn defer(&mut self, peer: NodeId, sdu: DeferredSdu) -> bool {
        let Some(state) = self.peers.get_mut(&peer) else {
            return false;
        };
        if state.deferred.len() >= self.capacity {
            self.stats.deferred_overflow += 1;
            warn!("Peer {}: deferral queue full, dropping SN {} on LCID {}", peer, sdu.sn, sdu.lcid);
            return false;
        }
        trace!("Peer {}: deferred SN {} on LCID {}", peer, sdu.sn, sdu.lcid);
        state.deferred.push_back(sdu);
        self.stats.deferred += 1;
        true
    }

    fn complete(
        &mut self,
        peer: NodeId,
        path: DeliveryPath,
        index: &PeerIndex,
        tx: &mut BTreeMap<EntityKey, RlcTxEntity>,
    ) -> SwitchCompletion {
        for key in index.entities(peer) {
            if let Some(entity) = tx.get_mut(&key) {
                entity.resume();
            }
        }
        self.paths.insert(peer, path);
        let deferred = match self.peers.get_mut(&peer) {
            Some(state) => {
                state.phase = SwitchPhase::Switched;
                state.deferred.drain(..).collect()
            }
            None => Vec::new(),
        };
        self.stats.completed += 1;
        info!("Peer {}: switched to {:?}, flushing {} deferred SDUs", peer, path, deferred.len());
        SwitchCompletion { peer, path, deferred }
    }

    /// Forget every peer
    pub fn clear(&mut self) {
        self.peers.clear();
        self.paths.clear();
    }
}

fn any_draining(peer: NodeId, index: &PeerIndex, tx: &BTreeMap<EntityKey, RlcTxEntity>) -> bool {
    index.entities(peer).iter().any(|k| tx.get(k).is_some_and(|e| e.is_draining()))
}
