//! D2D Data Plane Layers Library
//!
//! Per-flow delivery engine of a device-to-device capable node: flow
//! classification and LCID assignment (RRC), sequence numbering and header
//! compression (PDCP), segmentation and reassembly (RLC), sidelink mode
//! switching (D2D) and the connection multiplexer tying them together.

pub mod rrc;
pub mod pdcp;
pub mod rlc;
pub mod d2d;
pub mod routing;
pub mod mux;

#[cfg(test)]
mod test_support;

pub use mux::{ConnectionMux, DeliveredSdu, Dispatch, DispatchOutcome, DropReason, MuxConfig, MuxStats, NodeRole};

use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid protocol data unit: {0}")]
    InvalidPdu(String),

    #[error("Unknown delivery mode {code} configured for '{application}'")]
    UnknownDeliveryMode { code: u8, application: String },

    #[error("LCID space exhausted")]
    LcidSpaceExhausted,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl LayerError {
    /// Errors that leave the node unable to carry traffic
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LayerError::UnknownDeliveryMode { .. } | LayerError::LcidSpaceExhausted | LayerError::ConfigurationError(_)
        )
    }
}
