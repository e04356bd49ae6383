//! Message Types crossing the layer boundary
//!
//! Defines what the application hands to the multiplexer, what the
//! multiplexer hands to the delivery collaborator, and the self-events the
//! layers schedule on the harness.

use bytes::Bytes;
use common::types::{DeliveryPath, Lcid, NodeId, RlcMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Address handed to the registry for node resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAddress {
    /// IPv4 address of a host
    Ip(Ipv4Addr),
    /// Opaque non-IP token (the node id for non-IP applications)
    Token(u32),
}

/// Transport protocol carried above the network header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Tcp,
    Udp,
    /// Anything the header compressor does not understand
    Other,
}

impl TransportProtocol {
    /// Wire code used inside PDCP PDUs
    pub fn code(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
            TransportProtocol::Other => 0,
        }
    }

    /// Decode a wire code; unknown codes map to `Other`
    pub fn from_code(code: u8) -> Self {
        match code {
            6 => TransportProtocol::Tcp,
            17 => TransportProtocol::Udp,
            _ => TransportProtocol::Other,
        }
    }
}

/// Per-layer header sizes of an application packet (bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeaderSizes {
    /// Network (IPv4) header size
    pub network: u16,
    /// Transport protocol
    pub transport_protocol: TransportProtocol,
    /// Transport header size
    pub transport: u16,
}

impl HeaderSizes {
    /// IPv4 + UDP
    pub fn ipv4_udp() -> Self {
        Self { network: 20, transport_protocol: TransportProtocol::Udp, transport: 8 }
    }

    /// IPv4 + TCP without options
    pub fn ipv4_tcp() -> Self {
        Self { network: 20, transport_protocol: TransportProtocol::Tcp, transport: 20 }
    }

    /// Non-IP traffic carries no upper headers
    pub fn none() -> Self {
        Self { network: 0, transport_protocol: TransportProtocol::Other, transport: 0 }
    }

    /// Combined header size
    pub fn total(&self) -> u32 {
        self.network as u32 + self.transport as u32
    }
}

/// Addressing of an application packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Addressing {
    /// IPv4 datagram
    Ip { src: SocketAddrV4, dst: SocketAddrV4 },
    /// Non-IP message between tokens
    NonIp { src: u32, dst: u32 },
}

impl Addressing {
    /// Destination token marking a non-IP broadcast
    pub const NON_IP_BROADCAST: u32 = u32::MAX;

    /// True when the destination is a group rather than a single node
    pub fn is_group(&self) -> bool {
        match self {
            Addressing::Ip { dst, .. } => dst.ip().is_multicast(),
            Addressing::NonIp { dst, .. } => *dst == Self::NON_IP_BROADCAST,
        }
    }

    /// Destination as a registry address
    pub fn destination(&self) -> NodeAddress {
        match self {
            Addressing::Ip { dst, .. } => NodeAddress::Ip(*dst.ip()),
            Addressing::NonIp { dst, .. } => NodeAddress::Token(*dst),
        }
    }
}

/// Packet handed down by the application
#[derive(Debug, Clone, PartialEq)]
pub struct AppPacket {
    /// Source and destination
    pub addressing: Addressing,
    /// Upper layer header sizes carried by the packet
    pub headers: HeaderSizes,
    /// Application payload
    pub payload: Bytes,
}

impl AppPacket {
    /// Create an IPv4/UDP packet
    pub fn udp(src: SocketAddrV4, dst: SocketAddrV4, payload: Bytes) -> Self {
        Self {
            addressing: Addressing::Ip { src, dst },
            headers: HeaderSizes::ipv4_udp(),
            payload,
        }
    }

    /// Create a non-IP packet
    pub fn non_ip(src: u32, dst: u32, payload: Bytes) -> Self {
        Self {
            addressing: Addressing::NonIp { src, dst },
            headers: HeaderSizes::none(),
            payload,
        }
    }
}

/// Where the delivery collaborator takes an emitted PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sink {
    /// Node whose flow produced the PDU
    pub origin: NodeId,
    /// Node the PDU is transmitted to (the origin itself for group-cast)
    pub next_hop: NodeId,
    /// Final recipients of the PDU
    pub recipients: Vec<NodeId>,
    /// LCID of the flow at the origin
    pub lcid: Lcid,
    /// RLC mode of the connection
    pub mode: RlcMode,
    /// Path the PDU travels on
    pub path: DeliveryPath,
}

/// Handle of an event scheduled on the harness
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events the layers receive from, or schedule on, the harness
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerEvent {
    /// The MAC grants room for up to `max_pdus` PDUs across all Tx entities
    /// of the node
    TxOpportunity { max_pdus: usize },
    /// Re-check whether a peer's buffers finished draining
    DrainCheck { peer: NodeId },
    /// Delivery path of the traffic exchanged with `peer` changes
    ModeSwitch { peer: NodeId, new_path: DeliveryPath, clear_buffer: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_addressing() {
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5000);
        let multicast = Addressing::Ip { src, dst: SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 10), 6000) };
        let unicast = Addressing::Ip { src, dst: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 6000) };
        assert!(multicast.is_group());
        assert!(!unicast.is_group());
        assert!(Addressing::NonIp { src: 1, dst: Addressing::NON_IP_BROADCAST }.is_group());
        assert!(!Addressing::NonIp { src: 1, dst: 2 }.is_group());
    }

    #[test]
    fn test_transport_codes() {
        for proto in [TransportProtocol::Tcp, TransportProtocol::Udp, TransportProtocol::Other] {
            assert_eq!(TransportProtocol::from_code(proto.code()), proto);
        }
        assert_eq!(TransportProtocol::from_code(99), TransportProtocol::Other);
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(HeaderSizes::ipv4_udp().total(), 28);
        assert_eq!(HeaderSizes::ipv4_tcp().total(), 40);
        assert_eq!(HeaderSizes::none().total(), 0);
    }
}
