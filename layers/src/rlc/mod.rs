//! Radio Link Control (RLC) Layer Implementation
//!
//! Per-connection transmit and receive entities. UM and AM connections
//! segment SDUs behind a 9 byte segment header (flags, SN, byte offset); TM
//! connections carry SDUs unsegmented and without a header.

pub mod rx;
pub mod tx;

pub use rx::{RlcRxEntity, RxState, RxStats};
pub use tx::{OutboundPdu, RlcTxEntity, TxState, TxStats};

use crate::LayerError;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use common::types::{Lcid, NodeId, RlcMode};
use nom::number::complete::{be_u32, be_u8};
use nom::sequence::tuple;
use nom::IResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the UM/AM segment header
pub const SEGMENT_HEADER_LEN: usize = 9;

bitflags! {
    /// Segment header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u8 {
        /// Segment starts the SDU
        const FIRST = 0x01;
        /// Segment ends the SDU
        const LAST = 0x02;
        /// AM poll request, set on the last segment
        const POLL = 0x04;
    }
}

/// Key of an RLC entity: the remote node and the LCID
///
/// For Tx entities the node is the next hop (the node itself for group-cast);
/// for Rx entities it is the originating peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub node: NodeId,
    pub lcid: Lcid,
}

impl EntityKey {
    pub fn new(node: NodeId, lcid: Lcid) -> Self {
        Self { node, lcid }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} lcid {}", self.node, self.lcid)
    }
}

/// RLC layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlcConfig {
    /// Tx queue capacity in PDUs
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Largest PDU handed to the lower layer, header included
    #[serde(default = "default_max_pdu_size")]
    pub max_pdu_size: usize,
    /// Rx reassembly window in SNs
    #[serde(default = "default_rx_window")]
    pub rx_window: u32,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_pdu_size() -> usize {
    1000
}

fn default_rx_window() -> u32 {
    512
}

impl Default for RlcConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_pdu_size: default_max_pdu_size(),
            rx_window: default_rx_window(),
        }
    }
}

impl RlcConfig {
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.queue_capacity == 0 {
            return Err(LayerError::ConfigurationError("RLC queue capacity must be positive".into()));
        }
        if self.max_pdu_size <= SEGMENT_HEADER_LEN {
            return Err(LayerError::ConfigurationError(format!(
                "RLC PDU size {} leaves no room for data behind a {} byte header",
                self.max_pdu_size, SEGMENT_HEADER_LEN
            )));
        }
        if self.rx_window == 0 {
            return Err(LayerError::ConfigurationError("RLC receive window must be positive".into()));
        }
        Ok(())
    }
}

/// RLC header overhead of a delivery mode
pub fn header_overhead(mode: RlcMode) -> usize {
    match mode {
        RlcMode::Tm => 0,
        RlcMode::Um | RlcMode::Am => SEGMENT_HEADER_LEN,
    }
}

/// UM/AM segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub flags: SegmentFlags,
    pub sn: u32,
    /// Byte offset of the segment inside its SDU
    pub offset: u32,
}

impl SegmentHeader {
    /// Prepend the header to a segment payload
    pub fn encode(&self, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_LEN + data.len());
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.sn);
        buf.put_u32(self.offset);
        buf.put_slice(data);
        buf.freeze()
    }

    /// Split a PDU into header and segment data
    pub fn parse(pdu: &Bytes) -> Result<(Self, Bytes), LayerError> {
        let (_, (flags, sn, offset)) = parse_header(pdu)
            .map_err(|e| LayerError::InvalidPdu(format!("RLC segment header: {:?}", e.map_input(|i| i.len()))))?;
        let flags = SegmentFlags::from_bits(flags)
            .ok_or_else(|| LayerError::InvalidPdu(format!("unknown RLC segment flags 0x{:02x}", flags)))?;
        Ok((Self { flags, sn, offset }, pdu.slice(SEGMENT_HEADER_LEN..)))
    }
}

fn parse_header(input: &[u8]) -> IResult<&[u8], (u8, u32, u32)> {
    tuple((be_u8, be_u32, be_u32))(input)
}
