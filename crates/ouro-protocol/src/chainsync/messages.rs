//! ChainSync wire messages.
//!
//! Tagged arrays `[type, fields...]`. Roll-forward headers travel as a
//! wrapped pair `[era, headerBytes]`; the header bytes themselves are
//! opaque to this layer and are forwarded to the application callback as
//! received.

use minicbor::data::Type;
use minicbor::Decoder;

use crate::common::{decode_point, decode_tip, encode_point, encode_tip, Point, Tip};
use crate::runtime::{EncodeError, Encoder};
use crate::{CodecError, Mode};

pub const MESSAGE_TYPE_REQUEST_NEXT: u8 = 0;
pub const MESSAGE_TYPE_AWAIT_REPLY: u8 = 1;
pub const MESSAGE_TYPE_ROLL_FORWARD: u8 = 2;
pub const MESSAGE_TYPE_ROLL_BACKWARD: u8 = 3;
pub const MESSAGE_TYPE_FIND_INTERSECT: u8 = 4;
pub const MESSAGE_TYPE_INTERSECT_FOUND: u8 = 5;
pub const MESSAGE_TYPE_INTERSECT_NOT_FOUND: u8 = 6;
pub const MESSAGE_TYPE_DONE: u8 = 7;

/// An era discriminant plus the raw header bytes for that era.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedHeader {
    pub era: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestNext,
    AwaitReply,
    RollForward { header: WrappedHeader, tip: Tip },
    RollBackward { point: Point, tip: Tip },
    FindIntersect { points: Vec<Point> },
    IntersectFound { point: Point, tip: Tip },
    IntersectNotFound { tip: Tip },
    Done,
}

impl crate::Message for Message {
    fn message_type(&self) -> u8 {
        match self {
            Message::RequestNext => MESSAGE_TYPE_REQUEST_NEXT,
            Message::AwaitReply => MESSAGE_TYPE_AWAIT_REPLY,
            Message::RollForward { .. } => MESSAGE_TYPE_ROLL_FORWARD,
            Message::RollBackward { .. } => MESSAGE_TYPE_ROLL_BACKWARD,
            Message::FindIntersect { .. } => MESSAGE_TYPE_FIND_INTERSECT,
            Message::IntersectFound { .. } => MESSAGE_TYPE_INTERSECT_FOUND,
            Message::IntersectNotFound { .. } => MESSAGE_TYPE_INTERSECT_NOT_FOUND,
            Message::Done => MESSAGE_TYPE_DONE,
        }
    }
}

/// The wire shape is mode-independent here: both modes carry headers as a
/// wrapped `[era, bytes]` pair.
pub fn encode(msg: &Message, _mode: Mode) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let mut e = minicbor::Encoder::new(&mut buf);
    encode_message(&mut e, msg).map_err(|err| CodecError(err.to_string()))?;
    Ok(buf)
}

/// Decode one message from the front of `bytes`; `Ok(None)` means the
/// buffer is still short of a whole message.
pub fn decode(bytes: &[u8], _mode: Mode) -> Result<Option<(Message, usize)>, CodecError> {
    let mut d = Decoder::new(bytes);
    match decode_message(&mut d) {
        Ok(msg) => Ok(Some((msg, d.position()))),
        Err(e) if e.is_end_of_input() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn encode_message(e: &mut Encoder<'_>, msg: &Message) -> Result<(), EncodeError> {
    match msg {
        Message::RequestNext => {
            e.array(1)?.u8(MESSAGE_TYPE_REQUEST_NEXT)?;
        }
        Message::AwaitReply => {
            e.array(1)?.u8(MESSAGE_TYPE_AWAIT_REPLY)?;
        }
        Message::RollForward { header, tip } => {
            e.array(3)?.u8(MESSAGE_TYPE_ROLL_FORWARD)?;
            e.array(2)?.u64(header.era)?.bytes(&header.payload)?;
            encode_tip(e, tip)?;
        }
        Message::RollBackward { point, tip } => {
            e.array(3)?.u8(MESSAGE_TYPE_ROLL_BACKWARD)?;
            encode_point(e, point)?;
            encode_tip(e, tip)?;
        }
        Message::FindIntersect { points } => {
            e.array(2)?.u8(MESSAGE_TYPE_FIND_INTERSECT)?;
            e.array(points.len() as u64)?;
            for point in points {
                encode_point(e, point)?;
            }
        }
        Message::IntersectFound { point, tip } => {
            e.array(3)?.u8(MESSAGE_TYPE_INTERSECT_FOUND)?;
            encode_point(e, point)?;
            encode_tip(e, tip)?;
        }
        Message::IntersectNotFound { tip } => {
            e.array(2)?.u8(MESSAGE_TYPE_INTERSECT_NOT_FOUND)?;
            encode_tip(e, tip)?;
        }
        Message::Done => {
            e.array(1)?.u8(MESSAGE_TYPE_DONE)?;
        }
    }
    Ok(())
}

fn decode_message(d: &mut Decoder<'_>) -> Result<Message, minicbor::decode::Error> {
    let Some(len) = d.array()? else {
        return Err(minicbor::decode::Error::message(
            "indefinite-length message array",
        ));
    };
    let msg_type = d.u8()?;
    match (msg_type, len) {
        (MESSAGE_TYPE_REQUEST_NEXT, 1) => Ok(Message::RequestNext),
        (MESSAGE_TYPE_AWAIT_REPLY, 1) => Ok(Message::AwaitReply),
        (MESSAGE_TYPE_ROLL_FORWARD, 3) => {
            let header = decode_header(d)?;
            let tip = decode_tip(d)?;
            Ok(Message::RollForward { header, tip })
        }
        (MESSAGE_TYPE_ROLL_BACKWARD, 3) => {
            let point = decode_point(d)?;
            let tip = decode_tip(d)?;
            Ok(Message::RollBackward { point, tip })
        }
        (MESSAGE_TYPE_FIND_INTERSECT, 2) => {
            let Some(n) = d.array()? else {
                return Err(minicbor::decode::Error::message(
                    "indefinite-length point list",
                ));
            };
            let mut points = Vec::with_capacity(n as usize);
            for _ in 0..n {
                points.push(decode_point(d)?);
            }
            Ok(Message::FindIntersect { points })
        }
        (MESSAGE_TYPE_INTERSECT_FOUND, 3) => {
            let point = decode_point(d)?;
            let tip = decode_tip(d)?;
            Ok(Message::IntersectFound { point, tip })
        }
        (MESSAGE_TYPE_INTERSECT_NOT_FOUND, 2) => {
            let tip = decode_tip(d)?;
            Ok(Message::IntersectNotFound { tip })
        }
        (MESSAGE_TYPE_DONE, 1) => Ok(Message::Done),
        (other, len) => Err(minicbor::decode::Error::message(format!(
            "unexpected chain-sync message: type {other}, {len} elements"
        ))),
    }
}

fn decode_header(d: &mut Decoder<'_>) -> Result<WrappedHeader, minicbor::decode::Error> {
    if d.array()? != Some(2) {
        return Err(minicbor::decode::Error::message(
            "header must be [era, bytes]",
        ));
    }
    let era = d.u64()?;
    // Node-to-client peers wrap the header bytes in an encoded-CBOR tag;
    // strip it either way.
    if d.datatype()? == Type::Tag {
        d.tag()?;
    }
    let payload = d.bytes()?.to_vec();
    Ok(WrappedHeader { era, payload })
}
