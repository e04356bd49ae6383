//! Registry / addressing collaborator
//!
//! Node lookups the layers need from the simulation: address resolution,
//! serving-node (next hop) queries, direct-delivery capability between UEs and
//! peer positions for proximity based group-cast.

use crate::message_types::NodeAddress;
use crate::InterfaceError;
use common::types::{NodeId, Position};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Lookups consumed by the multiplexer
pub trait Registry: Send + Sync {
    /// Resolve an address to the node currently owning it
    fn resolve_node(&self, address: &NodeAddress) -> Option<NodeId>;

    /// Serving base station (or relay) of a node
    fn serving_node(&self, node: NodeId) -> Option<NodeId>;

    /// Whether `a` can reach `b` over the sidelink
    fn direct_delivery_capable(&self, a: NodeId, b: NodeId) -> bool;

    /// Current position of a node
    fn peer_position(&self, node: NodeId) -> Option<Position>;

    /// Every UE currently part of the simulated population
    fn peers(&self) -> Vec<NodeId>;
}

/// Kind of registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Ue,
    BaseStation,
}

/// Registry entry of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node id
    pub id: NodeId,
    /// UE or base station
    pub kind: NodeKind,
    /// IPv4 address, if the node has one
    pub ip: Option<Ipv4Addr>,
    /// Serving base station or relay (UEs only)
    pub serving: Option<NodeId>,
    /// Position of the node
    pub position: Option<Position>,
}

#[derive(Default)]
struct RegistryState {
    nodes: BTreeMap<NodeId, NodeRecord>,
    by_ip: HashMap<Ipv4Addr, NodeId>,
    capabilities: BTreeSet<(NodeId, NodeId)>,
}

/// In-memory registry, shared by every node of a run
#[derive(Default)]
pub struct StaticRegistry {
    state: RwLock<RegistryState>,
}

impl StaticRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node
    pub fn register(&self, record: NodeRecord) -> Result<(), InterfaceError> {
        let mut state = self.state.write();
        if state.nodes.contains_key(&record.id) {
            return Err(InterfaceError::DuplicateNode(record.id));
        }
        if let Some(ip) = record.ip {
            state.by_ip.insert(ip, record.id);
        }
        debug!("Registered node {} ({:?}) ip={:?}", record.id, record.kind, record.ip);
        state.nodes.insert(record.id, record);
        Ok(())
    }

    /// Remove a node that left the simulation
    pub fn unregister(&self, id: NodeId) -> Result<NodeRecord, InterfaceError> {
        let mut state = self.state.write();
        let record = state.nodes.remove(&id).ok_or(InterfaceError::UnknownNode(id))?;
        if let Some(ip) = record.ip {
            state.by_ip.remove(&ip);
        }
        state.capabilities.retain(|(a, b)| *a != id && *b != id);
        info!("Node {} left the simulation", id);
        Ok(record)
    }

    /// Declare a symmetric sidelink capability between two UEs
    pub fn add_direct_capability(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.write();
        state.capabilities.insert((a, b));
        state.capabilities.insert((b, a));
    }

    /// Move a node
    pub fn set_position(&self, id: NodeId, position: Position) -> Result<(), InterfaceError> {
        let mut state = self.state.write();
        let record = state.nodes.get_mut(&id).ok_or(InterfaceError::UnknownNode(id))?;
        record.position = Some(position);
        Ok(())
    }

    /// Attach a UE to another serving node (handover)
    pub fn set_serving(&self, id: NodeId, serving: NodeId) -> Result<(), InterfaceError> {
        let mut state = self.state.write();
        let record = state.nodes.get_mut(&id).ok_or(InterfaceError::UnknownNode(id))?;
        record.serving = Some(serving);
        Ok(())
    }

    /// Snapshot of a node record
    pub fn record(&self, id: NodeId) -> Option<NodeRecord> {
        self.state.read().nodes.get(&id).cloned()
    }
}

impl Registry for StaticRegistry {
    fn resolve_node(&self, address: &NodeAddress) -> Option<NodeId> {
        let state = self.state.read();
        match address {
            NodeAddress::Ip(ip) => state.by_ip.get(ip).copied(),
            NodeAddress::Token(token) => {
                let id = NodeId(u16::try_from(*token).ok()?);
                state.nodes.contains_key(&id).then_some(id)
            }
        }
    }

    fn serving_node(&self, node: NodeId) -> Option<NodeId> {
        self.state.read().nodes.get(&node).and_then(|r| r.serving)
    }

    fn direct_delivery_capable(&self, a: NodeId, b: NodeId) -> bool {
        self.state.read().capabilities.contains(&(a, b))
    }

    fn peer_position(&self, node: NodeId) -> Option<Position> {
        self.state.read().nodes.get(&node).and_then(|r| r.position)
    }

    fn peers(&self) -> Vec<NodeId> {
        self.state
            .read()
            .nodes
            .values()
            .filter(|r| r.kind == NodeKind::Ue)
            .map(|r| r.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ue(id: u16, ip: [u8; 4], serving: u16, x: f64) -> NodeRecord {
        NodeRecord {
            id: NodeId(id),
            kind: NodeKind::Ue,
            ip: Some(Ipv4Addr::from(ip)),
            serving: Some(NodeId(serving)),
            position: Some(Position::new(x, 0.0, 0.0)),
        }
    }

    fn registry() -> StaticRegistry {
        let registry = StaticRegistry::new();
        registry
            .register(NodeRecord {
                id: NodeId(1),
                kind: NodeKind::BaseStation,
                ip: Some(Ipv4Addr::new(10, 0, 0, 254)),
                serving: None,
                position: Some(Position::default()),
            })
            .unwrap();
        registry.register(ue(2, [10, 0, 0, 2], 1, 10.0)).unwrap();
        registry.register(ue(3, [10, 0, 0, 3], 1, 20.0)).unwrap();
        registry
    }

    #[test]
    fn test_resolve_and_serving() {
        let registry = registry();
        assert_eq!(registry.resolve_node(&NodeAddress::Ip(Ipv4Addr::new(10, 0, 0, 3))), Some(NodeId(3)));
        assert_eq!(registry.resolve_node(&NodeAddress::Token(2)), Some(NodeId(2)));
        assert_eq!(registry.resolve_node(&NodeAddress::Token(70_000)), None);
        assert_eq!(registry.serving_node(NodeId(2)), Some(NodeId(1)));
        assert_eq!(registry.peers(), vec![NodeId(2), NodeId(3)]);
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = registry();
        assert!(matches!(
            registry.register(ue(2, [10, 0, 0, 9], 1, 0.0)),
            Err(InterfaceError::DuplicateNode(NodeId(2)))
        ));
    }

    #[test]
    fn test_unregister_drops_capabilities() {
        let registry = registry();
        registry.add_direct_capability(NodeId(2), NodeId(3));
        assert!(registry.direct_delivery_capable(NodeId(3), NodeId(2)));

        registry.unregister(NodeId(3)).unwrap();
        assert!(!registry.direct_delivery_capable(NodeId(2), NodeId(3)));
        assert_eq!(registry.resolve_node(&NodeAddress::Ip(Ipv4Addr::new(10, 0, 0, 3))), None);
        assert!(registry.unregister(NodeId(3)).is_err());
    }

    #[test]
    fn test_mobility_updates() {
        let registry = registry();
        registry.set_position(NodeId(2), Position::new(5.0, 5.0, 0.0)).unwrap();
        registry.set_serving(NodeId(2), NodeId(3)).unwrap();
        assert_eq!(registry.peer_position(NodeId(2)), Some(Position::new(5.0, 5.0, 0.0)));
        assert_eq!(registry.serving_node(NodeId(2)), Some(NodeId(3)));
        assert!(registry.set_position(NodeId(42), Position::default()).is_err());
    }
}
