//! Handshake wire messages.
//!
//! Each message is a tagged array: `[type, fields...]`. Version data is
//! mode-dependent: node-to-node carries `[magic, diffusionMode]`,
//! node-to-client a bare magic.

use std::collections::BTreeMap;
use std::fmt;

use minicbor::Decoder;

use crate::runtime::{EncodeError, Encoder};
use crate::{CodecError, Mode};

pub const MESSAGE_TYPE_PROPOSE_VERSIONS: u8 = 0;
pub const MESSAGE_TYPE_ACCEPT_VERSION: u8 = 1;
pub const MESSAGE_TYPE_REFUSE: u8 = 2;

pub const REFUSE_REASON_VERSION_MISMATCH: u8 = 0;
pub const REFUSE_REASON_DECODE_ERROR: u8 = 1;
pub const REFUSE_REASON_REFUSED: u8 = 2;

/// Per-version negotiation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionData {
    NodeToNode {
        network_magic: u32,
        /// Diffusion mode: false = initiator only, true = initiator and
        /// responder (full duplex).
        initiator_and_responder: bool,
    },
    NodeToClient {
        network_magic: u32,
    },
}

impl VersionData {
    pub fn network_magic(&self) -> u32 {
        match self {
            VersionData::NodeToNode { network_magic, .. } => *network_magic,
            VersionData::NodeToClient { network_magic } => *network_magic,
        }
    }

    /// Whether the peer granted full-duplex diffusion. Always false for
    /// node-to-client.
    pub fn full_duplex(&self) -> bool {
        matches!(
            self,
            VersionData::NodeToNode {
                initiator_and_responder: true,
                ..
            }
        )
    }
}

/// Why the server refused every proposed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefuseReason {
    VersionMismatch { supported: Vec<u16> },
    DecodeError { version: u16, message: String },
    Refused { version: u16, message: String },
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefuseReason::VersionMismatch { supported } => {
                write!(f, "version mismatch, server supports {supported:?}")
            }
            RefuseReason::DecodeError { version, message } => {
                write!(f, "decode error for version {version}: {message}")
            }
            RefuseReason::Refused { version, message } => {
                write!(f, "version {version} refused: {message}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keys ascend on the wire (decoders must not rely on it, but canonical
    /// order keeps traces stable).
    ProposeVersions {
        version_map: BTreeMap<u16, VersionData>,
    },
    AcceptVersion {
        version: u16,
        version_data: VersionData,
    },
    Refuse(RefuseReason),
}

impl crate::Message for Message {
    fn message_type(&self) -> u8 {
        match self {
            Message::ProposeVersions { .. } => MESSAGE_TYPE_PROPOSE_VERSIONS,
            Message::AcceptVersion { .. } => MESSAGE_TYPE_ACCEPT_VERSION,
            Message::Refuse(_) => MESSAGE_TYPE_REFUSE,
        }
    }
}

/// Encoding needs no mode: the version-data variant already fixes the wire
/// shape.
pub fn encode(msg: &Message, _mode: Mode) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let mut e = minicbor::Encoder::new(&mut buf);
    encode_message(&mut e, msg).map_err(|err| CodecError(err.to_string()))?;
    Ok(buf)
}

/// Decode one message from the front of `bytes`; `Ok(None)` means the
/// buffer is still short of a whole message.
pub fn decode(bytes: &[u8], mode: Mode) -> Result<Option<(Message, usize)>, CodecError> {
    let mut d = Decoder::new(bytes);
    match decode_message(&mut d, mode) {
        Ok(msg) => Ok(Some((msg, d.position()))),
        Err(e) if e.is_end_of_input() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn encode_message(e: &mut Encoder<'_>, msg: &Message) -> Result<(), EncodeError> {
    match msg {
        Message::ProposeVersions { version_map } => {
            e.array(2)?.u8(MESSAGE_TYPE_PROPOSE_VERSIONS)?;
            e.map(version_map.len() as u64)?;
            for (version, data) in version_map {
                e.u16(*version)?;
                encode_version_data(e, data)?;
            }
        }
        Message::AcceptVersion {
            version,
            version_data,
        } => {
            e.array(3)?.u8(MESSAGE_TYPE_ACCEPT_VERSION)?.u16(*version)?;
            encode_version_data(e, version_data)?;
        }
        Message::Refuse(reason) => {
            e.array(2)?.u8(MESSAGE_TYPE_REFUSE)?;
            encode_refuse_reason(e, reason)?;
        }
    }
    Ok(())
}

fn decode_message(d: &mut Decoder<'_>, mode: Mode) -> Result<Message, minicbor::decode::Error> {
    let len = definite_array(d)?;
    let msg_type = d.u8()?;
    match (msg_type, len) {
        (MESSAGE_TYPE_PROPOSE_VERSIONS, 2) => {
            let Some(entries) = d.map()? else {
                return Err(minicbor::decode::Error::message(
                    "indefinite-length version map",
                ));
            };
            let mut version_map = BTreeMap::new();
            for _ in 0..entries {
                let version = d.u16()?;
                let data = decode_version_data(d, mode)?;
                version_map.insert(version, data);
            }
            Ok(Message::ProposeVersions { version_map })
        }
        (MESSAGE_TYPE_ACCEPT_VERSION, 3) => {
            let version = d.u16()?;
            let version_data = decode_version_data(d, mode)?;
            Ok(Message::AcceptVersion {
                version,
                version_data,
            })
        }
        (MESSAGE_TYPE_REFUSE, 2) => Ok(Message::Refuse(decode_refuse_reason(d)?)),
        (other, len) => Err(minicbor::decode::Error::message(format!(
            "unexpected handshake message: type {other}, {len} elements"
        ))),
    }
}

fn encode_version_data(e: &mut Encoder<'_>, data: &VersionData) -> Result<(), EncodeError> {
    match data {
        VersionData::NodeToNode {
            network_magic,
            initiator_and_responder,
        } => {
            e.array(2)?
                .u32(*network_magic)?
                .bool(*initiator_and_responder)?;
        }
        VersionData::NodeToClient { network_magic } => {
            e.u32(*network_magic)?;
        }
    }
    Ok(())
}

fn decode_version_data(
    d: &mut Decoder<'_>,
    mode: Mode,
) -> Result<VersionData, minicbor::decode::Error> {
    match mode {
        Mode::NodeToNode => {
            if d.array()? != Some(2) {
                return Err(minicbor::decode::Error::message(
                    "node-to-node version data must be [magic, diffusionMode]",
                ));
            }
            let network_magic = d.u32()?;
            let initiator_and_responder = d.bool()?;
            Ok(VersionData::NodeToNode {
                network_magic,
                initiator_and_responder,
            })
        }
        Mode::NodeToClient => Ok(VersionData::NodeToClient {
            network_magic: d.u32()?,
        }),
    }
}

fn encode_refuse_reason(e: &mut Encoder<'_>, reason: &RefuseReason) -> Result<(), EncodeError> {
    match reason {
        RefuseReason::VersionMismatch { supported } => {
            e.array(2)?.u8(REFUSE_REASON_VERSION_MISMATCH)?;
            e.array(supported.len() as u64)?;
            for version in supported {
                e.u16(*version)?;
            }
        }
        RefuseReason::DecodeError { version, message } => {
            e.array(3)?
                .u8(REFUSE_REASON_DECODE_ERROR)?
                .u16(*version)?
                .str(message)?;
        }
        RefuseReason::Refused { version, message } => {
            e.array(3)?
                .u8(REFUSE_REASON_REFUSED)?
                .u16(*version)?
                .str(message)?;
        }
    }
    Ok(())
}

fn decode_refuse_reason(d: &mut Decoder<'_>) -> Result<RefuseReason, minicbor::decode::Error> {
    let len = definite_array(d)?;
    match (d.u8()?, len) {
        (REFUSE_REASON_VERSION_MISMATCH, 2) => {
            let Some(n) = d.array()? else {
                return Err(minicbor::decode::Error::message(
                    "indefinite-length version list",
                ));
            };
            let mut supported = Vec::with_capacity(n as usize);
            for _ in 0..n {
                supported.push(d.u16()?);
            }
            Ok(RefuseReason::VersionMismatch { supported })
        }
        (REFUSE_REASON_DECODE_ERROR, 3) => Ok(RefuseReason::DecodeError {
            version: d.u16()?,
            message: d.str()?.to_string(),
        }),
        (REFUSE_REASON_REFUSED, 3) => Ok(RefuseReason::Refused {
            version: d.u16()?,
            message: d.str()?.to_string(),
        }),
        (other, len) => Err(minicbor::decode::Error::message(format!(
            "unknown refusal reason {other} with {len} elements"
        ))),
    }
}

fn definite_array(d: &mut Decoder<'_>) -> Result<u64, minicbor::decode::Error> {
    d.array()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite-length array"))
}
