//! Segment codec for the shared transport.
//!
//! Wire format (big-endian, 8-byte header):
//!
//! ```text
//! [timestamp:u32][role_bit:1|protocol_id:15][payload_length:u16][payload...]
//! ```
//!
//! The timestamp is stamped from a monotonic clock at transmit time and is
//! advisory only; receivers carry it through but never act on it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{MuxError, Role};

/// Segment header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload carried by one segment.
pub const MAX_SEGMENT_PAYLOAD: usize = 65535;

/// Protocol ids occupy 15 bits; the high bit of the field is the role flag.
pub const MAX_PROTOCOL_ID: u16 = 0x7fff;

const RESPONDER_BIT: u16 = 0x8000;

/// One framed unit on the wire: a chunk of a single mini-protocol's
/// message stream.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Transmit timestamp in microseconds, wrapping. Populated on receive;
    /// ignored on send (the codec stamps a fresh value).
    pub timestamp: u32,
    pub protocol_id: u16,
    pub role: Role,
    pub payload: Bytes,
}

impl Segment {
    pub fn new(protocol_id: u16, role: Role, payload: Bytes) -> Self {
        Self {
            timestamp: 0,
            protocol_id,
            role,
            payload,
        }
    }
}

/// Codec for framing segments over a byte stream.
pub struct SegmentCodec {
    start: std::time::Instant,
}

impl SegmentCodec {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SegmentCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SegmentCodec {
    type Item = Segment;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[6], src[7]]) as usize;
        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let timestamp = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let id_field = u16::from_be_bytes([src[4], src[5]]);
        let role = if id_field & RESPONDER_BIT != 0 {
            Role::Responder
        } else {
            Role::Initiator
        };

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        Ok(Some(Segment {
            timestamp,
            protocol_id: id_field & MAX_PROTOCOL_ID,
            role,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(segment) => Ok(Some(segment)),
            None if src.is_empty() => Ok(None),
            None => Err(MuxError::Framing(format!(
                "stream ended mid-segment with {} bytes pending",
                src.len()
            ))),
        }
    }
}

impl Encoder<Segment> for SegmentCodec {
    type Error = MuxError;

    fn encode(&mut self, item: Segment, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_SEGMENT_PAYLOAD {
            return Err(MuxError::PayloadTooLarge {
                size: item.payload.len(),
            });
        }
        if item.protocol_id > MAX_PROTOCOL_ID {
            return Err(MuxError::Framing(format!(
                "protocol id {} exceeds 15 bits",
                item.protocol_id
            )));
        }

        // Wrapping cast is intentional: the wire field is 32 bits of
        // microseconds and rolls over after ~71 minutes.
        let timestamp = self.start.elapsed().as_micros() as u32;
        let mut id_field = item.protocol_id;
        if item.role == Role::Responder {
            id_field |= RESPONDER_BIT;
        }

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_u32(timestamp);
        dst.put_u16(id_field);
        dst.put_u16(item.payload.len() as u16);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}
