//! Peer index: D2D peer → Tx entities carrying its flows

use crate::rlc::EntityKey;
use common::types::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Tx entities serving each direct-capable peer, over any path
#[derive(Debug, Default)]
pub struct PeerIndex {
    entries: BTreeMap<NodeId, BTreeSet<EntityKey>>,
}

impl PeerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a Tx entity with a peer
    pub fn register(&mut self, peer: NodeId, key: EntityKey) {
        if self.entries.entry(peer).or_default().insert(key) {
            trace!("Peer {} now served by {}", peer, key);
        }
    }

    /// Entities associated with a peer, in key order
    pub fn entities(&self, peer: NodeId) -> Vec<EntityKey> {
        self.entries.get(&peer).map(|keys| keys.iter().copied().collect()).unwrap_or_default()
    }

    pub fn contains(&self, peer: NodeId) -> bool {
        self.entries.contains_key(&peer)
    }

    /// Peers with at least one entity
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    /// Keep only the entities `keep` accepts; peers left without any are
    /// forgotten
    pub fn retain(&mut self, mut keep: impl FnMut(&EntityKey) -> bool) {
        for keys in self.entries.values_mut() {
            keys.retain(|key| keep(key));
        }
        self.entries.retain(|_, keys| !keys.is_empty());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::Lcid;

    #[test]
    fn test_register_is_idempotent_and_ordered() {
        let mut index = PeerIndex::new();
        let peer = NodeId(7);
        index.register(peer, EntityKey::new(NodeId(1), Lcid(2)));
        index.register(peer, EntityKey::new(peer, Lcid(2)));
        index.register(peer, EntityKey::new(NodeId(1), Lcid(2)));

        assert_eq!(
            index.entities(peer),
            vec![EntityKey::new(NodeId(1), Lcid(2)), EntityKey::new(peer, Lcid(2))]
        );
        assert!(index.entities(NodeId(8)).is_empty());
        assert_eq!(index.peers().collect::<Vec<_>>(), vec![peer]);

        index.retain(|key| key.node == peer);
        assert_eq!(index.entities(peer), vec![EntityKey::new(peer, Lcid(2))]);
        index.retain(|_| false);
        assert!(!index.contains(peer));

        index.register(peer, EntityKey::new(peer, Lcid(3)));
        index.clear();
        assert!(!index.contains(peer));
    }
}
