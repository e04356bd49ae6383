//! Common Utilities and Types Library
//! 
//! This crate provides shared identifiers, value types and utilities used
//! across the D2D data plane crates.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;
