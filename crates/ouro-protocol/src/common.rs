//! Chain location types shared by the protocols.
//!
//! A `Point` is a position on the chain, either the origin or a
//! (slot, block hash) pair; a `Tip` is the peer's best-known chain head.
//! Both travel as positional CBOR arrays.

use std::fmt;

use minicbor::Decoder;

use crate::runtime::{EncodeError, Encoder};

/// A position on the chain.
#[derive(Clone, PartialEq, Eq)]
pub enum Point {
    /// The start of the chain; encoded as an empty array.
    Origin,
    Specific { slot: u64, hash: Vec<u8> },
}

impl Point {
    pub fn specific(slot: u64, hash: Vec<u8>) -> Point {
        Point::Specific { slot, hash }
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Point::Origin => f.write_str("Origin"),
            Point::Specific { slot, hash } => {
                write!(f, "Point({slot}, {})", hex::encode(hash))
            }
        }
    }
}

/// The best-known chain head reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tip {
    pub point: Point,
    pub block_number: u64,
}

impl Tip {
    pub fn new(point: Point, block_number: u64) -> Tip {
        Tip {
            point,
            block_number,
        }
    }
}

pub fn encode_point(e: &mut Encoder<'_>, point: &Point) -> Result<(), EncodeError> {
    match point {
        Point::Origin => {
            e.array(0)?;
        }
        Point::Specific { slot, hash } => {
            e.array(2)?.u64(*slot)?.bytes(hash)?;
        }
    }
    Ok(())
}

pub fn decode_point(d: &mut Decoder<'_>) -> Result<Point, minicbor::decode::Error> {
    match d.array()? {
        Some(0) => Ok(Point::Origin),
        Some(2) => {
            let slot = d.u64()?;
            let hash = d.bytes()?.to_vec();
            Ok(Point::Specific { slot, hash })
        }
        _ => Err(minicbor::decode::Error::message(
            "point must be an empty array or [slot, hash]",
        )),
    }
}

pub fn encode_tip(e: &mut Encoder<'_>, tip: &Tip) -> Result<(), EncodeError> {
    e.array(2)?;
    encode_point(e, &tip.point)?;
    e.u64(tip.block_number)?;
    Ok(())
}

pub fn decode_tip(d: &mut Decoder<'_>) -> Result<Tip, minicbor::decode::Error> {
    if d.array()? != Some(2) {
        return Err(minicbor::decode::Error::message(
            "tip must be [point, block number]",
        ));
    }
    let point = decode_point(d)?;
    let block_number = d.u64()?;
    Ok(Tip {
        point,
        block_number,
    })
}
