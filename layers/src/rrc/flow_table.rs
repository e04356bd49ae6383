//! Flow table: flow key → LCID assignment
//!
//! LCIDs are handed out from a single per-node counter starting at 1 and are
//! never reused for the lifetime of the node. The table also owns the
//! connection descriptor of every assigned LCID.

use crate::LayerError;
use common::types::{ApplicationType, DeliveryPath, Direction, FlowKey, Lcid, NodeId, TrafficClass};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error};

/// Mutable per-LCID connection metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescriptor {
    pub lcid: Lcid,
    pub application: ApplicationType,
    pub traffic_class: TrafficClass,
    /// Raw RLC type code as classified
    pub rlc_type: u8,
    pub priority: u8,
    pub direction: Direction,
    /// This node, when the destination is a direct-capable peer
    pub d2d_tx_peer: Option<NodeId>,
    /// The destination, when it is a direct-capable peer
    pub d2d_rx_peer: Option<NodeId>,
    pub multicast_group: Option<u32>,
    /// Path the flow currently takes
    pub path: DeliveryPath,
    /// Last PDCP sequence number issued on this connection
    pub last_sn: Option<u32>,
}

/// Per-node flow table
#[derive(Debug)]
pub struct FlowTable {
    lcids: HashMap<FlowKey, Lcid>,
    descriptors: BTreeMap<Lcid, ConnectionDescriptor>,
    next_lcid: u16,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            lcids: HashMap::new(),
            descriptors: BTreeMap::new(),
            next_lcid: Lcid::FIRST.value(),
        }
    }

    /// LCID assigned to a flow, if any
    pub fn lookup(&self, key: &FlowKey) -> Option<Lcid> {
        self.lcids.get(key).copied()
    }

    /// Assign the next LCID to a new flow
    pub fn create(&mut self, key: FlowKey) -> Result<Lcid, LayerError> {
        if let Some(lcid) = self.lcids.get(&key) {
            return Ok(*lcid);
        }
        if self.next_lcid >= Lcid::NOT_FOUND.value() {
            error!("No LCID left for flow {}", key);
            return Err(LayerError::LcidSpaceExhausted);
        }
        let lcid = Lcid(self.next_lcid);
        self.next_lcid += 1;
        self.lcids.insert(key, lcid);
        debug!("Connection not found for flow {}, assigned LCID {}", key, lcid);
        Ok(lcid)
    }

    /// Look the flow up, assigning an LCID on first use
    ///
    /// Returns the LCID and whether it was freshly created.
    pub fn lookup_or_create(&mut self, key: FlowKey) -> Result<(Lcid, bool), LayerError> {
        match self.lookup(&key) {
            Some(lcid) => Ok((lcid, false)),
            None => self.create(key).map(|lcid| (lcid, true)),
        }
    }

    /// Store or replace the descriptor of an LCID
    pub fn set_descriptor(&mut self, descriptor: ConnectionDescriptor) {
        self.descriptors.insert(descriptor.lcid, descriptor);
    }

    pub fn descriptor(&self, lcid: Lcid) -> Option<&ConnectionDescriptor> {
        self.descriptors.get(&lcid)
    }

    pub fn descriptor_mut(&mut self, lcid: Lcid) -> Option<&mut ConnectionDescriptor> {
        self.descriptors.get_mut(&lcid)
    }

    /// Descriptors of every connection towards a D2D peer
    pub fn descriptors_for_peer(&mut self, peer: NodeId) -> impl Iterator<Item = &mut ConnectionDescriptor> {
        self.descriptors.values_mut().filter(move |d| d.d2d_rx_peer == Some(peer))
    }

    /// Number of flows known
    pub fn len(&self) -> usize {
        self.lcids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lcids.is_empty()
    }

    /// Forget every flow and descriptor
    ///
    /// The LCID counter is kept so ids are never handed out twice.
    pub fn clear(&mut self) {
        self.lcids.clear();
        self.descriptors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip_key(src_port: u16, dst_port: u16) -> FlowKey {
        FlowKey::Ip {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            src_port,
            dst_port,
            direction: Direction::Uplink,
        }
    }

    #[test]
    fn test_distinct_keys_get_distinct_lcids() {
        let mut table = FlowTable::new();
        let a = table.create(ip_key(5000, 6000)).unwrap();
        let b = table.create(ip_key(5001, 6000)).unwrap();
        let c = table.create(FlowKey::NonIp { src: 1, dst: 2 }).unwrap();
        assert_eq!((a, b, c), (Lcid(1), Lcid(2), Lcid(3)));

        assert_eq!(table.lookup(&ip_key(5000, 6000)), Some(a));
        assert_eq!(table.lookup(&ip_key(5000, 6000)), Some(a));
        assert_eq!(table.lookup(&ip_key(9, 9)), None);
    }

    #[test]
    fn test_direction_is_part_of_the_key() {
        let mut table = FlowTable::new();
        let up = table.create(ip_key(5000, 6000)).unwrap();
        let mut key = ip_key(5000, 6000);
        if let FlowKey::Ip { direction, .. } = &mut key {
            *direction = Direction::D2d;
        }
        let (d2d, created) = table.lookup_or_create(key).unwrap();
        assert!(created);
        assert_ne!(up, d2d);
        assert_eq!(table.lookup_or_create(key).unwrap(), (d2d, false));
    }

    #[test]
    fn test_lcid_space_exhausted() {
        let mut table = FlowTable::new();
        table.next_lcid = 0xFFFE;
        assert_eq!(table.create(FlowKey::NonIp { src: 1, dst: 1 }).unwrap(), Lcid(0xFFFE));
        assert!(matches!(
            table.create(FlowKey::NonIp { src: 1, dst: 2 }),
            Err(LayerError::LcidSpaceExhausted)
        ));
    }

    #[test]
    fn test_clear_never_reuses_ids() {
        let mut table = FlowTable::new();
        table.create(ip_key(1, 1)).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.create(ip_key(1, 1)).unwrap(), Lcid(2));
    }
}
