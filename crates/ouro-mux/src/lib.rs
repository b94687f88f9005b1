//! Ouro Mux -- segment framing and multiplexing over one duplex stream.
//!
//! Every mini-protocol shares a single bidirectional byte stream. Outbound
//! payloads are chopped into segments (8-byte header + up to 64 KB of
//! payload) and interleaved fairly; inbound segments are routed to the
//! registered protocol by (protocol id, role).

use std::fmt;

pub mod mux;
pub mod segment;

pub use mux::{EgressHandle, Muxer, ProtocolChannel};
pub use segment::{Segment, SegmentCodec, HEADER_SIZE, MAX_PROTOCOL_ID, MAX_SEGMENT_PAYLOAD};

/// Which side of the connection originated a segment.
///
/// Encoded as the high bit of the protocol-id field in the segment header:
/// 0 = initiator, 1 = responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The opposite role. Inbound segments for a local protocol carry the
    /// peer's role bit, so registration lookups flip the local role.
    pub fn flip(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("transport closed")]
    TransportClosed,
    #[error("framing error: {0}")]
    Framing(String),
    #[error("unknown protocol: id {protocol_id} ({role})")]
    UnknownProtocol { protocol_id: u16, role: Role },
    #[error("segment payload too large: {size} bytes (max {max})", max = MAX_SEGMENT_PAYLOAD)]
    PayloadTooLarge { size: usize },
    #[error("registration rejected: {0}")]
    Registration(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
