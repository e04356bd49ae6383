//! Destination resolution per node role
//!
//! Each role maps to one resolver, picked when the multiplexer is built.

use crate::d2d::ModeSwitchCoordinator;
use common::types::{multicast_group_id, DeliveryPath, Direction, NodeId, Position};
use interfaces::{Addressing, AppPacket, Registry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// Role of the node owning a multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// UE without sidelink: everything goes to the serving node
    Mobile,
    /// Base station: downlink, possibly through a relay
    BaseStation,
    /// UE able to reach peers directly
    PeerDirect,
}

/// Why a packet could not be routed or queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Destination is not (or no longer) registered
    UnknownDestination,
    /// The node has no serving node to send through
    NoServingNode,
    /// Tx or deferral queue at capacity
    QueueFull,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::UnknownDestination => write!(f, "unknown destination"),
            DropReason::NoServingNode => write!(f, "no serving node"),
            DropReason::QueueFull => write!(f, "queue full"),
        }
    }
}

/// Resolved route of one packet
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Node the PDUs are transmitted to; the node itself for group-cast
    pub next_hop: NodeId,
    pub recipients: Vec<NodeId>,
    pub path: DeliveryPath,
    /// Destination, when it is a direct-capable peer
    pub d2d_peer: Option<NodeId>,
    pub multicast_group: Option<u32>,
}

/// What a resolver may consult
pub struct RouteContext<'a> {
    pub node: NodeId,
    pub registry: &'a dyn Registry,
    pub switches: &'a ModeSwitchCoordinator,
    pub cutoff_radius: f64,
}

impl RouteContext<'_> {
    fn destination(&self, packet: &AppPacket) -> Option<NodeId> {
        self.registry.resolve_node(&packet.addressing.destination())
    }

    /// Next hop of traffic towards `peer` on `path`
    pub fn next_hop_for(&self, peer: NodeId, path: DeliveryPath) -> Option<NodeId> {
        match path {
            DeliveryPath::Direct | DeliveryPath::Multicast => Some(peer),
            DeliveryPath::Infrastructure => self.registry.serving_node(self.node),
        }
    }
}

pub type Resolver = fn(&RouteContext<'_>, &AppPacket) -> Result<Route, DropReason>;

/// Resolver used by a role
pub fn resolver_for(role: NodeRole) -> Resolver {
    match role {
        NodeRole::Mobile => resolve_mobile,
        NodeRole::BaseStation => resolve_base_station,
        NodeRole::PeerDirect => resolve_peer_direct,
    }
}

/// Direction recorded in the flow key
///
/// Unicast traffic to a direct-capable peer is keyed `D2d` whatever path it
/// currently takes, so the LCID survives mode switches.
pub fn flow_direction(role: NodeRole, ctx: &RouteContext<'_>, packet: &AppPacket) -> Direction {
    match role {
        NodeRole::Mobile => Direction::Uplink,
        NodeRole::BaseStation => Direction::Downlink,
        NodeRole::PeerDirect if packet.addressing.is_group() => Direction::D2dMulti,
        NodeRole::PeerDirect => match ctx.destination(packet) {
            Some(dst) if ctx.registry.direct_delivery_capable(ctx.node, dst) => Direction::D2d,
            _ => Direction::Uplink,
        },
    }
}

fn resolve_mobile(ctx: &RouteContext<'_>, packet: &AppPacket) -> Result<Route, DropReason> {
    let serving = ctx.registry.serving_node(ctx.node).ok_or(DropReason::NoServingNode)?;
    // unresolvable destinations terminate at the serving node
    let recipient = ctx.destination(packet).unwrap_or(serving);
    Ok(Route {
        next_hop: serving,
        recipients: vec![recipient],
        path: DeliveryPath::Infrastructure,
        d2d_peer: None,
        multicast_group: None,
    })
}

fn resolve_base_station(ctx: &RouteContext<'_>, packet: &AppPacket) -> Result<Route, DropReason> {
    let destination = ctx.destination(packet).ok_or(DropReason::UnknownDestination)?;
    let next_hop = match ctx.registry.serving_node(destination) {
        Some(relay) if relay != ctx.node => {
            trace!("Node {} reached through relay {}", destination, relay);
            relay
        }
        _ => destination,
    };
    Ok(Route {
        next_hop,
        recipients: vec![destination],
        path: DeliveryPath::Infrastructure,
        d2d_peer: None,
        multicast_group: None,
    })
}

fn resolve_peer_direct(ctx: &RouteContext<'_>, packet: &AppPacket) -> Result<Route, DropReason> {
    if packet.addressing.is_group() {
        let positions: BTreeMap<NodeId, Position> = ctx
            .registry
            .peers()
            .into_iter()
            .filter_map(|peer| ctx.registry.peer_position(peer).map(|p| (peer, p)))
            .collect();
        let multicast_group = match packet.addressing {
            Addressing::Ip { dst, .. } => multicast_group_id(*dst.ip()),
            Addressing::NonIp { .. } => None,
        };
        return Ok(Route {
            next_hop: ctx.node,
            recipients: select_group_recipients(ctx.node, &positions, ctx.cutoff_radius),
            path: DeliveryPath::Multicast,
            d2d_peer: None,
            multicast_group,
        });
    }

    let destination = ctx.destination(packet).ok_or(DropReason::UnknownDestination)?;
    if !ctx.registry.direct_delivery_capable(ctx.node, destination) {
        return resolve_mobile(ctx, packet);
    }
    let path = ctx.switches.current_path(destination);
    let next_hop = ctx.next_hop_for(destination, path).ok_or(DropReason::NoServingNode)?;
    Ok(Route {
        next_hop,
        recipients: vec![destination],
        path,
        d2d_peer: Some(destination),
        multicast_group: None,
    })
}

/// Peers within `radius` of `source`, excluding the source itself
///
/// Peers at the very same spot as the source are not considered in range.
/// A source without a known position reaches nobody.
pub fn select_group_recipients(source: NodeId, positions: &BTreeMap<NodeId, Position>, radius: f64) -> Vec<NodeId> {
    let Some(origin) = positions.get(&source) else {
        return Vec::new();
    };
    positions
        .iter()
        .filter(|(peer, _)| **peer != source)
        .filter(|(_, position)| {
            let distance = origin.distance(position);
            distance > 0.0 && distance <= radius
        })
        .map(|(peer, _)| *peer)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::line_registry;
    use bytes::Bytes;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn packet(dst: Ipv4Addr) -> AppPacket {
        AppPacket::udp(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5000),
            SocketAddrV4::new(dst, 6000),
            Bytes::from_static(b"x"),
        )
    }

    fn ctx<'a>(node: u16, registry: &'a dyn Registry, switches: &'a ModeSwitchCoordinator) -> RouteContext<'a> {
        RouteContext { node: NodeId(node), registry, switches, cutoff_radius: 100.0 }
    }

    #[test]
    fn test_group_recipients_by_distance() {
        let positions = BTreeMap::from([
            (NodeId(1), Position::new(0.0, 0.0, 0.0)),
            (NodeId(2), Position::new(60.0, 80.0, 0.0)),
            (NodeId(3), Position::new(100.1, 0.0, 0.0)),
            (NodeId(4), Position::new(0.0, 0.0, 0.0)),
            (NodeId(5), Position::new(0.0, -20.0, 0.0)),
        ]);
        assert_eq!(select_group_recipients(NodeId(1), &positions, 100.0), vec![NodeId(2), NodeId(5)]);
        assert!(select_group_recipients(NodeId(9), &positions, 100.0).is_empty());
    }

    #[test]
    fn test_peer_direct_routes() {
        let registry = line_registry();
        let switches = ModeSwitchCoordinator::new(8, 1000);
        let ctx = ctx(2, &registry, &switches);
        let resolve = resolver_for(NodeRole::PeerDirect);

        let direct = resolve(&ctx, &packet(Ipv4Addr::new(10, 0, 0, 3))).unwrap();
        assert_eq!(direct.next_hop, NodeId(3));
        assert_eq!(direct.path, DeliveryPath::Direct);
        assert_eq!(direct.d2d_peer, Some(NodeId(3)));

        let fallback = resolve(&ctx, &packet(Ipv4Addr::new(10, 0, 0, 4))).unwrap();
        assert_eq!(fallback.next_hop, NodeId(1));
        assert_eq!(fallback.path, DeliveryPath::Infrastructure);
        assert_eq!(fallback.recipients, vec![NodeId(4)]);

        assert_eq!(
            resolve(&ctx, &packet(Ipv4Addr::new(10, 0, 0, 99))),
            Err(DropReason::UnknownDestination)
        );

        let group = resolve(&ctx, &packet(Ipv4Addr::new(224, 0, 0, 5))).unwrap();
        assert_eq!(group.next_hop, NodeId(2));
        assert_eq!(group.recipients, vec![NodeId(3)]);
        assert_eq!(group.multicast_group, Some(5));
    }

    #[test]
    fn test_base_station_relay() {
        let registry = line_registry();
        registry.set_serving(NodeId(4), NodeId(3)).unwrap();
        let switches = ModeSwitchCoordinator::new(8, 1000);
        let ctx = ctx(1, &registry, &switches);
        let resolve = resolver_for(NodeRole::BaseStation);

        assert_eq!(resolve(&ctx, &packet(Ipv4Addr::new(10, 0, 0, 2))).unwrap().next_hop, NodeId(2));
        let relayed = resolve(&ctx, &packet(Ipv4Addr::new(10, 0, 0, 4))).unwrap();
        assert_eq!((relayed.next_hop, relayed.recipients), (NodeId(3), vec![NodeId(4)]));
    }

    #[test]
    fn test_flow_direction() {
        let registry = line_registry();
        let switches = ModeSwitchCoordinator::new(8, 1000);
        let ctx = ctx(2, &registry, &switches);
        assert_eq!(flow_direction(NodeRole::PeerDirect, &ctx, &packet(Ipv4Addr::new(10, 0, 0, 3))), Direction::D2d);
        assert_eq!(flow_direction(NodeRole::PeerDirect, &ctx, &packet(Ipv4Addr::new(10, 0, 0, 4))), Direction::Uplink);
        assert_eq!(
            flow_direction(NodeRole::PeerDirect, &ctx, &packet(Ipv4Addr::new(239, 1, 1, 1))),
            Direction::D2dMulti
        );
        assert_eq!(flow_direction(NodeRole::Mobile, &ctx, &packet(Ipv4Addr::new(10, 0, 0, 3))), Direction::Uplink);
    }
}
