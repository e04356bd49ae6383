//! Collaborator Interfaces Library
//!
//! This crate defines the boundary between the data plane layers and the
//! surrounding simulation: the registry/addressing collaborator, the delivery
//! and timer interface, the messages crossing it, and the deterministic event
//! queue the harness drives everything with.

pub mod message_types;
pub mod registry;
pub mod delivery;
pub mod event_queue;

pub use delivery::DeliveryInterface;
pub use event_queue::EventQueue;
pub use message_types::{
    Addressing, AppPacket, EventId, HeaderSizes, LayerEvent, NodeAddress, Sink, TransportProtocol,
};
pub use registry::{NodeRecord, Registry, StaticRegistry};

use common::types::{NodeId, SimTime};
use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Event scheduled in the past: {at} < {now}")]
    ScheduleInPast { at: SimTime, now: SimTime },

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Node already registered: {0}")]
    DuplicateNode(NodeId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
