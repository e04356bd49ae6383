//! Radio Resource Control (RRC) Layer Implementation
//!
//! Connection bookkeeping of a node: traffic classification and the
//! flow → LCID table with per-connection descriptors.

pub mod classifier;
pub mod flow_table;

pub use classifier::{ClassificationTable, TrafficProfile};
pub use flow_table::{ConnectionDescriptor, FlowTable};
