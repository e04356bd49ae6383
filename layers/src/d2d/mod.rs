//! Device-to-device (sidelink) support
//!
//! Tracks which Tx entities serve each direct-capable peer and switches a
//! peer's traffic between the direct and infrastructure paths.

pub mod mode_switch;
pub mod peer_index;

pub use mode_switch::{DeferredSdu, ModeSwitchCoordinator, SwitchCompletion, SwitchPhase, SwitchStats};
pub use peer_index::PeerIndex;
