//! Common Utilities
//!
//! Provides utility functions used across the data plane crates

use tracing::trace;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex dump of at most `limit` leading bytes, for trace logs of large PDUs
pub fn bytes_to_hex_prefix(data: &[u8], limit: usize) -> String {
    if data.len() <= limit {
        return bytes_to_hex(data);
    }
    format!("{} .. (+{} bytes)", bytes_to_hex(&data[..limit]), data.len() - limit)
}

/// Number of segments needed to carry `len` bytes in chunks of `chunk` bytes
///
/// An empty SDU still occupies one segment.
pub fn segment_count(len: usize, chunk: usize) -> usize {
    if chunk == 0 {
        return 0;
    }
    let count = if len == 0 { 1 } else { (len + chunk - 1) / chunk };
    trace!("{} bytes need {} segments of {} bytes", len, count, chunk);
    count
}

/// Time utilities for scenario scheduling
pub mod time {
    /// Truncate a microsecond timestamp to whole milliseconds
    pub fn truncate_to_millis(us: u64) -> u64 {
        us - us % 1000
    }
}
