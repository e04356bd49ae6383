//! Delivery and timer interface provided by the simulation harness

use crate::message_types::{EventId, LayerEvent, Sink};
use bytes::Bytes;
use common::types::SimTime;

/// Lower-layer transmission and self-scheduling, owned by the harness
///
/// Layers never keep a reference to it: one is passed into every handler
/// that may transmit or schedule, and it is only used for that call.
pub trait DeliveryInterface {
    /// Current virtual time
    fn now(&self) -> SimTime;

    /// Hand an emitted PDU to the lower layer
    fn send(&mut self, pdu: Bytes, sink: Sink);

    /// Schedule `event` back to the calling node at `at`
    fn schedule_at(&mut self, at: SimTime, event: LayerEvent) -> EventId;

    /// Cancel a scheduled event; no-op (returns false) once it fired
    fn cancel(&mut self, id: EventId) -> bool;
}
