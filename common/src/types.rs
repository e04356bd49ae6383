//! Common Types for the D2D Data Plane
//!
//! Defines fundamental identifiers and value types shared by every layer

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;
use std::net::Ipv4Addr;

/// Node identifier (MAC node id) registered with the simulation registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Create a new node id
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the node id value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical Connection Identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lcid(pub u16);

impl Lcid {
    /// Reserved id carrying control traffic
    pub const CONTROL: Self = Self(0);
    /// First id handed out to data flows
    pub const FIRST: Self = Self(1);
    /// Sentinel returned by lookups that miss
    pub const NOT_FOUND: Self = Self(0xFFFF);

    /// Get the LCID value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// True for the reserved control channel
    pub fn is_control(&self) -> bool {
        *self == Self::CONTROL
    }
}

impl fmt::Display for Lcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Traffic direction of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// UE towards its serving node
    Uplink,
    /// Serving node towards a UE
    Downlink,
    /// Unicast device-to-device
    D2d,
    /// Group-cast device-to-device
    D2dMulti,
}

/// Path a flow currently takes towards its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    /// Through the serving base station (or relay)
    Infrastructure,
    /// Straight to the peer over the sidelink
    Direct,
    /// Sidelink group-cast to every peer in range
    Multicast,
}

/// RLC delivery modes
///
/// Configuration carries these as raw codes, so unknown values survive until
/// dispatch where they are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum RlcMode {
    /// Transparent Mode
    Tm = 0,
    /// Unacknowledged Mode
    Um = 1,
    /// Acknowledged Mode
    Am = 2,
}

/// Traffic classes used for flow classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    Conversational,
    Streaming,
    Interactive,
    Background,
}

/// Application types recognised by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    Voip,
    Gaming,
    Vod,
    Cbr,
    /// Safety alert / cooperative awareness beacon
    Alert,
}

/// Flow identification tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKey {
    /// Address based traffic
    Ip {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        direction: Direction,
    },
    /// Non-addressed traffic identified by opaque tokens
    NonIp {
        src: u32,
        dst: u32,
    },
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKey::Ip { src, dst, src_port, dst_port, direction } => {
                write!(f, "{}:{} -> {}:{} ({:?})", src, src_port, dst, dst_port, direction)
            }
            FlowKey::NonIp { src, dst } => write!(f, "token {} -> token {}", src, dst),
        }
    }
}

/// Cartesian position reported by the mobility collaborator
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Position {
    /// Create a new position
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another position
    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Virtual simulation time in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(pub u64);

impl SimTime {
    /// Start of the simulation
    pub const ZERO: Self = Self(0);

    /// Time from a millisecond count
    pub fn from_millis(ms: u64) -> Self {
        Self(ms * 1000)
    }

    /// Time from a microsecond count
    pub fn from_micros(us: u64) -> Self {
        Self(us)
    }

    /// Microseconds since the start of the run
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Whole milliseconds since the start of the run
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Add a microsecond offset
    pub fn plus_micros(&self, us: u64) -> Self {
        Self(self.0.saturating_add(us))
    }

    /// Add a millisecond offset
    pub fn plus_millis(&self, ms: u64) -> Self {
        self.plus_micros(ms.saturating_mul(1000))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}ms", self.0 / 1000, self.0 % 1000)
    }
}

/// Multicast group derived from an IPv4 multicast address
///
/// Multicast addresses live in 224.0.0.0/4; the remaining 28 host bits are
/// unique network-wide and identify the group.
pub fn multicast_group_id(addr: Ipv4Addr) -> Option<u32> {
    if !addr.is_multicast() {
        return None;
    }
    Some(u32::from(addr) & 0x0FFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_multicast_group_id() {
        let addr = Ipv4Addr::new(224, 1, 2, 3);
        let x = u32::from(addr);
        assert_eq!(multicast_group_id(addr), Some(x & 0x0FFF_FFFF));
        assert_eq!(multicast_group_id(Ipv4Addr::new(239, 255, 0, 1)), Some(0x0FFF_0001));
        assert_eq!(multicast_group_id(Ipv4Addr::new(10, 0, 0, 1)), None);
    }

    #[test]
    fn test_rlc_mode_codes() {
        assert_eq!(RlcMode::from_u8(0), Some(RlcMode::Tm));
        assert_eq!(RlcMode::from_u8(1), Some(RlcMode::Um));
        assert_eq!(RlcMode::from_u8(2), Some(RlcMode::Am));
        assert_eq!(RlcMode::from_u8(7), None);
    }

    #[test]
    fn test_position_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert_eq!(a.distance(&b), 5.0);
        assert_eq!(b.distance(&b), 0.0);
    }

    #[test]
    fn test_sim_time() {
        let t = SimTime::from_millis(3).plus_micros(250);
        assert_eq!(t.as_micros(), 3250);
        assert_eq!(t.as_millis(), 3);
        assert_eq!(t.to_string(), "3.250ms");
    }

    #[test]
    fn test_reserved_lcids() {
        assert!(Lcid::CONTROL.is_control());
        assert!(!Lcid::FIRST.is_control());
        assert_ne!(Lcid::FIRST, Lcid::NOT_FOUND);
    }
}
