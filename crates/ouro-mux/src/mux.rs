//! Multiplexer -- fan-out of inbound segments, fair fan-in of outbound
//! payloads.
//!
//! One ingress task routes segments to per-protocol sinks by
//! (protocol id, role). One egress task drains per-protocol byte lanes with
//! a rotating cursor, emitting at most one segment (<= 64 KB) per turn so no
//! protocol with pending bytes is starved. A framing or transport error on
//! either half is fatal for the whole connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;

use crate::segment::{Segment, SegmentCodec, MAX_SEGMENT_PAYLOAD};
use crate::{MuxError, Role};

/// Capacity of the shared egress channel, in payload chunks.
const EGRESS_CHANNEL_SIZE: usize = 64;

/// Capacity of each protocol's ingress channel, in segments.
const INGRESS_CHANNEL_SIZE: usize = 16;

struct Registry {
    sealed: bool,
    sinks: HashMap<(u16, Role), mpsc::Sender<Bytes>>,
}

/// The pair of queue endpoints a protocol instance uses to talk to the mux.
pub struct ProtocolChannel {
    /// Payload bytes of inbound segments addressed to this protocol.
    pub ingress: mpsc::Receiver<Bytes>,
    /// Outbound payload sink; the mux chunks into segments.
    pub egress: EgressHandle,
}

/// Cloneable sender for one protocol's outbound payload stream.
#[derive(Clone)]
pub struct EgressHandle {
    protocol_id: u16,
    role: Role,
    tx: mpsc::Sender<EgressChunk>,
}

impl EgressHandle {
    /// Queue payload bytes for transmission. Suspends while the egress
    /// channel is full; fails once the mux has shut down.
    pub async fn send(&self, payload: Bytes) -> Result<(), MuxError> {
        self.tx
            .send(EgressChunk {
                protocol_id: self.protocol_id,
                role: self.role,
                payload,
            })
            .await
            .map_err(|_| MuxError::TransportClosed)
    }
}

struct EgressChunk {
    protocol_id: u16,
    role: Role,
    payload: Bytes,
}

/// Multiplexes registered mini-protocols over one duplex stream.
pub struct Muxer {
    registry: Arc<Mutex<Registry>>,
    egress_tx: mpsc::Sender<EgressChunk>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Muxer {
    /// Wrap a duplex stream and spawn the ingress and egress tasks.
    ///
    /// The returned receiver yields mux-level failures (transport closed,
    /// framing error, unknown protocol); the first one is fatal for the
    /// connection.
    pub fn new<S>(stream: S) -> (Muxer, mpsc::Receiver<MuxError>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::new(Mutex::new(Registry {
            sealed: false,
            sinks: HashMap::new(),
        }));
        let (egress_tx, egress_rx) = mpsc::channel(EGRESS_CHANNEL_SIZE);
        let (error_tx, error_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);

        let framed = Framed::new(stream, SegmentCodec::new());
        let (sink, source) = framed.split();

        tokio::spawn(run_ingress(
            source,
            registry.clone(),
            error_tx.clone(),
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(run_egress(
            sink,
            egress_rx,
            error_tx,
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        (
            Muxer {
                registry,
                egress_tx,
                shutdown_tx,
            },
            error_rx,
        )
    }

    /// Register a mini-protocol under its id and local role.
    ///
    /// Inbound segments carry the peer's role bit, so the ingress table is
    /// keyed by the flipped role.
    pub fn register(&self, protocol_id: u16, role: Role) -> Result<ProtocolChannel, MuxError> {
        let key = (protocol_id, role.flip());
        let mut registry = lock(&self.registry);
        if registry.sealed {
            return Err(MuxError::Registration(format!(
                "registry sealed, cannot add protocol {protocol_id}"
            )));
        }
        if registry.sinks.contains_key(&key) {
            return Err(MuxError::Registration(format!(
                "protocol {protocol_id} ({role}) already registered"
            )));
        }

        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CHANNEL_SIZE);
        registry.sinks.insert(key, ingress_tx);
        tracing::debug!(protocol_id, %role, "registered protocol");

        Ok(ProtocolChannel {
            ingress: ingress_rx,
            egress: EgressHandle {
                protocol_id,
                role,
                tx: self.egress_tx.clone(),
            },
        })
    }

    /// Freeze the registration set. Later `register` calls fail.
    pub fn seal(&self) {
        lock(&self.registry).sealed = true;
    }

    /// Stop both pump tasks. Registered protocols observe transport closure.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn lock(registry: &Mutex<Registry>) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run_ingress<S>(
    mut source: futures::stream::SplitStream<Framed<S, SegmentCodec>>,
    registry: Arc<Mutex<Registry>>,
    error_tx: mpsc::Sender<MuxError>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let segment = tokio::select! {
            item = source.next() => item,
            _ = shutdown.recv() => break,
        };

        match segment {
            Some(Ok(segment)) => {
                let sink = lock(&registry)
                    .sinks
                    .get(&(segment.protocol_id, segment.role))
                    .cloned();
                let Some(sink) = sink else {
                    let _ = error_tx
                        .send(MuxError::UnknownProtocol {
                            protocol_id: segment.protocol_id,
                            role: segment.role,
                        })
                        .await;
                    break;
                };
                tracing::trace!(
                    protocol_id = segment.protocol_id,
                    role = %segment.role,
                    len = segment.payload.len(),
                    "ingress segment"
                );
                let delivered = tokio::select! {
                    res = sink.send(segment.payload) => res.is_ok(),
                    _ = shutdown.recv() => return finish_ingress(&registry, &shutdown_tx),
                };
                if !delivered {
                    // The protocol's receive pump already terminated.
                    tracing::debug!(
                        protocol_id = segment.protocol_id,
                        "dropping segment for stopped protocol"
                    );
                }
            }
            Some(Err(e)) => {
                tracing::warn!("ingress failure: {e}");
                let _ = error_tx.send(e).await;
                break;
            }
            None => {
                tracing::debug!("transport closed by peer");
                let _ = error_tx.send(MuxError::TransportClosed).await;
                break;
            }
        }
    }
    finish_ingress(&registry, &shutdown_tx);
}

fn finish_ingress(registry: &Mutex<Registry>, shutdown_tx: &broadcast::Sender<()>) {
    // Dropping the sinks closes every protocol's ingress channel, which the
    // receive pumps observe as transport closure.
    lock(registry).sinks.clear();
    let _ = shutdown_tx.send(());
}

async fn run_egress<S>(
    mut sink: futures::stream::SplitSink<Framed<S, SegmentCodec>, Segment>,
    mut egress_rx: mpsc::Receiver<EgressChunk>,
    error_tx: mpsc::Sender<MuxError>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // One lane per (protocol, role), created on first use. Lane order is
    // arrival order; the cursor rotates over it.
    let mut lanes: Vec<((u16, Role), BytesMut)> = Vec::new();
    let mut cursor = 0usize;

    'outer: loop {
        // Pick up everything already queued without blocking.
        loop {
            match egress_rx.try_recv() {
                Ok(chunk) => stash(&mut lanes, chunk),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if lanes.iter().all(|(_, buf)| buf.is_empty()) {
                        break 'outer;
                    }
                    break;
                }
            }
        }

        if lanes.iter().all(|(_, buf)| buf.is_empty()) {
            tokio::select! {
                chunk = egress_rx.recv() => match chunk {
                    Some(chunk) => {
                        stash(&mut lanes, chunk);
                        continue;
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }

        let n = lanes.len();
        let Some(idx) = (0..n)
            .map(|i| (cursor + i) % n)
            .find(|&i| !lanes[i].1.is_empty())
        else {
            continue;
        };

        let ((protocol_id, role), buf) = &mut lanes[idx];
        let take = buf.len().min(MAX_SEGMENT_PAYLOAD);
        let segment = Segment::new(*protocol_id, *role, buf.split_to(take).freeze());
        cursor = (idx + 1) % n;

        let sent = tokio::select! {
            res = sink.send(segment) => res,
            _ = shutdown.recv() => break,
        };
        if let Err(e) = sent {
            tracing::warn!("egress failure: {e}");
            let _ = error_tx.send(e).await;
            break;
        }
    }
    let _ = shutdown_tx.send(());
}

fn stash(lanes: &mut Vec<((u16, Role), BytesMut)>, chunk: EgressChunk) {
    let key = (chunk.protocol_id, chunk.role);
    match lanes.iter_mut().find(|(k, _)| *k == key) {
        Some((_, buf)) => buf.extend_from_slice(&chunk.payload),
        None => lanes.push((key, BytesMut::from(&chunk.payload[..]))),
    }
}
