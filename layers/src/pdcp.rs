//! Packet Data Convergence Protocol (PDCP) Layer Implementation
//!
//! One entity per LCID: per-flow sequence numbering, header compression and
//! the PDCP PDU wire format shared by both ends of a connection.

use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};
use common::types::{Lcid, RlcMode};
use interfaces::{HeaderSizes, TransportProtocol};
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::sequence::tuple;
use nom::IResult;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Smallest compressed header the compressor can produce
pub const MIN_COMPRESSED_HEADER_SIZE: u16 = 3;

/// PDCP header length on a UM connection
pub const PDCP_HEADER_UM: u16 = 1;
/// PDCP header length on an AM connection
pub const PDCP_HEADER_AM: u16 = 2;
/// PDCP header length on a TM connection
pub const PDCP_HEADER_TM: u16 = 1;

const FLAG_ROHC: u8 = 0x01;

/// PDCP layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdcpConfig {
    /// Size of the compressed header in bytes; absent disables compression
    #[serde(default)]
    pub header_compressed_size: Option<u16>,
    /// Packets whose network + transport headers are smaller than this are
    /// sent uncompressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: u16,
}

fn default_compression_threshold() -> u16 {
    20
}

impl Default for PdcpConfig {
    fn default() -> Self {
        Self {
            header_compressed_size: None,
            compression_threshold: default_compression_threshold(),
        }
    }
}

impl PdcpConfig {
    /// Reject compressed sizes the compressor cannot honour
    pub fn validate(&self) -> Result<(), LayerError> {
        match self.header_compressed_size {
            Some(size) if size < MIN_COMPRESSED_HEADER_SIZE => Err(LayerError::ConfigurationError(format!(
                "Size of compressed header must not be less than {} (got {})",
                MIN_COMPRESSED_HEADER_SIZE, size
            ))),
            _ => Ok(()),
        }
    }
}

/// PDCP header length for a delivery mode
pub fn pdcp_header_len(mode: RlcMode) -> u16 {
    match mode {
        RlcMode::Um => PDCP_HEADER_UM,
        RlcMode::Am => PDCP_HEADER_AM,
        RlcMode::Tm => PDCP_HEADER_TM,
    }
}

/// Original header sizes recorded when compression was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RohcContext {
    /// Network header size before compression
    pub orig_network: u16,
    /// Transport header size before compression (0 when not compressed)
    pub orig_transport: u16,
    /// Size of the ROHC header prepended by the compressor
    pub rohc_header: u16,
}

/// PDCP data PDU
#[derive(Debug, Clone, PartialEq)]
pub struct PdcpPdu {
    /// PDCP sequence number
    pub sn: u32,
    /// Current upper layer header sizes
    pub headers: HeaderSizes,
    /// Present when the headers were compressed
    pub rohc: Option<RohcContext>,
    /// Application payload
    pub payload: Bytes,
}

impl PdcpPdu {
    /// Wrap an application payload
    pub fn new(sn: u32, headers: HeaderSizes, payload: Bytes) -> Self {
        Self { sn, headers, rohc: None, payload }
    }

    /// Size the PDU occupies on the air in the given mode
    pub fn modeled_len(&self, mode: RlcMode) -> usize {
        let rohc = self.rohc.map(|r| r.rohc_header).unwrap_or(0);
        pdcp_header_len(mode) as usize + rohc as usize + self.headers.total() as usize + self.payload.len()
    }

    /// Serialize for the RLC layer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.payload.len());
        buf.put_u32(self.sn);
        buf.put_u8(if self.rohc.is_some() { FLAG_ROHC } else { 0 });
        buf.put_u16(self.headers.network);
        buf.put_u8(self.headers.transport_protocol.code());
        buf.put_u16(self.headers.transport);
        if let Some(rohc) = &self.rohc {
            buf.put_u16(rohc.orig_network);
            buf.put_u16(rohc.orig_transport);
            buf.put_u16(rohc.rohc_header);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a PDU reassembled by the RLC layer
    pub fn parse(data: &Bytes) -> Result<Self, LayerError> {
        let (remaining, (sn, flags, network, proto, transport)) =
            parse_fixed_header(data).map_err(|e| malformed("PDCP header", e))?;

        let (remaining, rohc) = if flags & FLAG_ROHC != 0 {
            let (remaining, (orig_network, orig_transport, rohc_header)) =
                tuple((be_u16, be_u16, be_u16))(remaining).map_err(|e| malformed("ROHC context", e))?;
            (remaining, Some(RohcContext { orig_network, orig_transport, rohc_header }))
        } else {
            (remaining, None)
        };

        let consumed = data.len() - remaining.len();
        Ok(Self {
            sn,
            headers: HeaderSizes {
                network,
                transport_protocol: TransportProtocol::from_code(proto),
                transport,
            },
            rohc,
            payload: data.slice(consumed..),
        })
    }
}

fn parse_fixed_header(input: &[u8]) -> IResult<&[u8], (u32, u8, u16, u8, u16)> {
    tuple((be_u32, be_u8, be_u16, be_u8, be_u16))(input)
}

fn malformed(what: &str, err: nom::Err<nom::error::Error<&[u8]>>) -> LayerError {
    LayerError::InvalidPdu(format!("{}: {:?}", what, err.map_input(|i| i.len())))
}

/// Per-LCID PDCP entity
#[derive(Debug)]
pub struct PdcpEntity {
    lcid: Lcid,
    /// Next PDCP sequence number for transmission
    tx_next: u32,
    compressed_size: Option<u16>,
    threshold: u16,
    /// SDUs delivered upwards
    rx_delivered: u64,
    last_rx_sn: Option<u32>,
}

impl PdcpEntity {
    /// Create an entity for a freshly assigned LCID
    pub fn new(lcid: Lcid, config: &PdcpConfig) -> Self {
        Self {
            lcid,
            tx_next: 0,
            compressed_size: config.header_compressed_size,
            threshold: config.compression_threshold,
            rx_delivered: 0,
            last_rx_sn: None,
        }
    }

    /// LCID served by this entity
    pub fn lcid(&self) -> Lcid {
        self.lcid
    }

    /// Return the current sequence number and advance the counter
    pub fn next_sequence_number(&mut self) -> u32 {
        let sn = self.tx_next;
        self.tx_next += 1;
        sn
    }

    /// Sequence numbers issued so far
    pub fn issued(&self) -> u32 {
        self.tx_next
    }

    /// Whether header compression is configured
    pub fn compression_enabled(&self) -> bool {
        self.compressed_size.is_some()
    }

    /// Compress the upper layer headers if enabled and worthwhile
    pub fn compress(&self, mut pdu: PdcpPdu) -> PdcpPdu {
        let Some(compressed_size) = self.compressed_size else {
            return pdu;
        };
        if pdu.rohc.is_some() || pdu.headers.total() < self.threshold as u32 {
            return pdu;
        }

        let (orig_transport, transport_compressed) = match pdu.headers.transport_protocol {
            TransportProtocol::Tcp | TransportProtocol::Udp => (pdu.headers.transport, 1),
            TransportProtocol::Other => {
                warn!("LCID {}: unknown transport header, cannot compress it", self.lcid);
                (0, 0)
            }
        };

        pdu.rohc = Some(RohcContext {
            orig_network: pdu.headers.network,
            orig_transport,
            rohc_header: compressed_size.saturating_sub(transport_compressed + 1),
        });
        pdu.headers.network = 1;
        if transport_compressed > 0 {
            pdu.headers.transport = transport_compressed;
        }
        trace!("LCID {}: header compression performed on SN {}", self.lcid, pdu.sn);
        pdu
    }

    /// Restore the header sizes recorded at compression time
    pub fn decompress(&self, mut pdu: PdcpPdu) -> PdcpPdu {
        let Some(rohc) = pdu.rohc.take() else {
            return pdu;
        };
        pdu.headers.network = rohc.orig_network;
        match pdu.headers.transport_protocol {
            TransportProtocol::Tcp | TransportProtocol::Udp => pdu.headers.transport = rohc.orig_transport,
            TransportProtocol::Other => {
                warn!("LCID {}: unknown transport header, cannot decompress it", self.lcid);
            }
        }
        trace!("LCID {}: header decompression performed on SN {}", self.lcid, pdu.sn);
        pdu
    }

    /// Account for an SDU delivered to the upper layer
    pub fn record_delivery(&mut self, sn: u32) {
        self.rx_delivered += 1;
        self.last_rx_sn = Some(sn);
        debug!("LCID {}: delivered SN {} ({} total)", self.lcid, sn, self.rx_delivered);
    }

    /// SDUs delivered upwards
    pub fn rx_delivered(&self) -> u64 {
        self.rx_delivered
    }

    /// SN of the last delivered SDU
    pub fn last_rx_sn(&self) -> Option<u32> {
        self.last_rx_sn
    }
}
