//! Test harness: a scripted peer speaking raw segments, plus a recording
//! ChainSync observer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use ouro_mux::{Role, Segment, SegmentCodec};
use ouro_net::{chainsync, handshake, Mode, Point, Tip};
use ouro_protocol::handshake::VersionData;
use ouro_protocol::runtime::DecodeFn;
use ouro_protocol::BoxError;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// The server side of a connection, driven explicitly by each test.
pub struct ScriptedPeer {
    framed: Framed<tokio::io::DuplexStream, SegmentCodec>,
    mode: Mode,
    buffers: HashMap<u16, BytesMut>,
}

impl ScriptedPeer {
    pub fn new(stream: tokio::io::DuplexStream, mode: Mode) -> ScriptedPeer {
        ScriptedPeer {
            framed: Framed::new(stream, SegmentCodec::new()),
            mode,
            buffers: HashMap::new(),
        }
    }

    /// Read segments for `protocol_id` until one whole message decodes.
    async fn expect_message<M>(&mut self, protocol_id: u16, decode: DecodeFn<M>) -> M {
        loop {
            let decoded = {
                let buf = self.buffers.entry(protocol_id).or_default();
                if buf.is_empty() {
                    None
                } else {
                    decode(&buf[..], self.mode)
                        .expect("peer failed to decode client message")
                        .map(|(msg, consumed)| {
                            let _ = buf.split_to(consumed);
                            msg
                        })
                }
            };
            if let Some(msg) = decoded {
                return msg;
            }

            let segment = self
                .framed
                .next()
                .await
                .expect("client closed the stream")
                .expect("client sent a malformed segment");
            assert_eq!(segment.protocol_id, protocol_id, "segment for wrong protocol");
            assert_eq!(segment.role, Role::Initiator, "client segments carry M=0");
            self.buffers
                .entry(segment.protocol_id)
                .or_default()
                .extend_from_slice(&segment.payload);
        }
    }

    pub async fn expect_handshake(&mut self) -> handshake::Message {
        self.expect_message(handshake::PROTOCOL_ID, handshake::messages::decode)
            .await
    }

    pub async fn expect_chainsync(&mut self) -> chainsync::Message {
        self.expect_message(chainsync::protocol_id(self.mode), chainsync::messages::decode)
            .await
    }

    async fn send_segment(&mut self, protocol_id: u16, payload: Vec<u8>) {
        self.framed
            .send(Segment::new(protocol_id, Role::Responder, Bytes::from(payload)))
            .await
            .expect("peer failed to write segment");
    }

    pub async fn send_handshake(&mut self, msg: &handshake::Message) {
        let payload = handshake::messages::encode(msg, self.mode).expect("encode");
        self.send_segment(handshake::PROTOCOL_ID, payload).await;
    }

    pub async fn send_chainsync(&mut self, msg: &chainsync::Message) {
        let payload = chainsync::messages::encode(msg, self.mode).expect("encode");
        self.send_segment(chainsync::protocol_id(self.mode), payload).await;
    }

    /// Consume the client's proposal and accept `version`.
    pub async fn accept_handshake(&mut self, version: u16, network_magic: u32, full_duplex: bool) {
        let propose = self.expect_handshake().await;
        assert!(
            matches!(propose, handshake::Message::ProposeVersions { .. }),
            "expected ProposeVersions, got {propose:?}"
        );
        let version_data = match self.mode {
            Mode::NodeToNode => VersionData::NodeToNode {
                network_magic,
                initiator_and_responder: full_duplex,
            },
            Mode::NodeToClient => VersionData::NodeToClient { network_magic },
        };
        self.send_handshake(&handshake::Message::AcceptVersion {
            version,
            version_data,
        })
        .await;
    }
}

/// What the ChainSync observer saw, in order.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    Forward {
        era: u64,
        header: Vec<u8>,
        tip: Tip,
    },
    Backward {
        point: Point,
        tip: Tip,
    },
}

/// Observer that records callbacks onto a channel for the test to drain.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<ChannelObserver>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelObserver { tx }), rx)
    }
}

impl ouro_net::ChainSyncObserver for ChannelObserver {
    fn roll_forward(&self, era: u64, header: &[u8], tip: &Tip) -> Result<(), BoxError> {
        let _ = self.tx.send(Event::Forward {
            era,
            header: header.to_vec(),
            tip: tip.clone(),
        });
        Ok(())
    }

    fn roll_backward(&self, point: &Point, tip: &Tip) -> Result<(), BoxError> {
        let _ = self.tx.send(Event::Backward {
            point: point.clone(),
            tip: tip.clone(),
        });
        Ok(())
    }
}

/// Poll until `cond` holds or `deadline` passes.
pub async fn wait_until<F: Fn() -> bool>(what: &str, deadline: Duration, cond: F) {
    let deadline = tokio::time::Instant::now() + deadline;
    loop {
        if cond() {
            return;
        }
        assert!(
            tokio::time::Instant::now() <= deadline,
            "timeout waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive the next observer event, failing after one second.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("observer channel closed")
}

pub fn tip(slot: u64, byte: u8, block_number: u64) -> Tip {
    Tip::new(Point::specific(slot, vec![byte; 32]), block_number)
}
