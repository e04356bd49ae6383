//! Test doubles shared by the layer tests

use bytes::Bytes;
use common::types::{NodeId, Position, SimTime};
use interfaces::registry::{NodeKind, NodeRecord};
use interfaces::{DeliveryInterface, EventId, LayerEvent, Sink, StaticRegistry};
use std::net::Ipv4Addr;

/// Delivery collaborator that records everything handed to it
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    pub now: SimTime,
    pub sent: Vec<(Bytes, Sink)>,
    pub scheduled: Vec<(EventId, SimTime, LayerEvent)>,
    pub cancelled: Vec<EventId>,
    pub fired: Vec<EventId>,
    next_id: u64,
}

impl DeliveryInterface for RecordingDelivery {
    fn now(&self) -> SimTime {
        self.now
    }

    fn send(&mut self, pdu: Bytes, sink: Sink) {
        self.sent.push((pdu, sink));
    }

    fn schedule_at(&mut self, at: SimTime, event: LayerEvent) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.scheduled.push((id, at, event));
        id
    }

    fn cancel(&mut self, id: EventId) -> bool {
        let known = self.scheduled.iter().any(|(s, _, _)| *s == id);
        if !known || self.fired.contains(&id) || self.cancelled.contains(&id) {
            return false;
        }
        self.cancelled.push(id);
        true
    }
}

/// Base station 1 serving UEs 2, 3 and 4 at 10.0.0.x on a line
///
/// UEs 2 and 3 are 30 m apart and direct-capable; UE 4 sits 500 m away.
pub fn line_registry() -> StaticRegistry {
    let registry = StaticRegistry::new();
    let nodes = [
        (1, NodeKind::BaseStation, None, 0.0),
        (2, NodeKind::Ue, Some(1), 10.0),
        (3, NodeKind::Ue, Some(1), 40.0),
        (4, NodeKind::Ue, Some(1), 510.0),
    ];
    for (id, kind, serving, x) in nodes {
        let record = NodeRecord {
            id: NodeId(id),
            kind,
            ip: Some(Ipv4Addr::new(10, 0, 0, id as u8)),
            serving: serving.map(NodeId),
            position: Some(Position::new(x, 0.0, 0.0)),
        };
        registry.register(record).unwrap();
    }
    registry.add_direct_capability(NodeId(2), NodeId(3));
    registry
}
