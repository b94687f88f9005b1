//! Mini-protocol runtime -- owns one state machine, its codec adapter, and
//! the receive pump.
//!
//! The send path and the receive pump are the only writers of a protocol's
//! state. Sends transition synchronously before the bytes are queued, so a
//! follow-up send observes the new agency; receives validate the message
//! type against the current state before transitioning and dispatching to
//! the handler. States where the peer holds agency may carry a timeout;
//! firing it is fatal for the protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use ouro_mux::{EgressHandle, MuxError, ProtocolChannel};
use tokio::sync::{broadcast, mpsc, watch};

use crate::{local_agency, Agency, CodecError, Message, Mode, ProtocolError, Role, State, StateMap};

/// Encoder writing into a plain byte vector.
pub type Encoder<'a> = minicbor::Encoder<&'a mut Vec<u8>>;

/// Encode failures against a byte vector cannot be I/O errors.
pub type EncodeError = minicbor::encode::Error<std::convert::Infallible>;

/// Decode one message from the front of `bytes`. `Ok(None)` means the
/// buffer does not yet hold a complete message; `Ok(Some((msg, n)))`
/// consumed `n` bytes.
pub type DecodeFn<M> = fn(&[u8], Mode) -> Result<Option<(M, usize)>, CodecError>;

/// Encode one message to its wire bytes.
pub type EncodeFn<M> = fn(&M, Mode) -> Result<Vec<u8>, CodecError>;

/// Side-effect hook invoked by the receive pump for every accepted message.
pub trait MessageHandler<M>: Send {
    fn on_message(&mut self, ctx: &mut HandlerContext<'_>, msg: M)
        -> Result<(), ProtocolError>;
}

/// Handle the pump passes to the message handler.
pub struct HandlerContext<'a> {
    state: &'a watch::Sender<State>,
}

impl HandlerContext<'_> {
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Override the machine state. Pipelined clients use this to re-enter
    /// an awaiting state while earlier requests are still outstanding.
    pub fn set_state(&mut self, state: State) {
        self.state.send_replace(state);
    }
}

/// Static description of a protocol instance.
pub struct ProtocolConfig<M: Message> {
    pub name: &'static str,
    pub mode: Mode,
    pub role: Role,
    pub state_map: StateMap,
    pub initial_state: State,
    pub decode: DecodeFn<M>,
    pub encode: EncodeFn<M>,
}

struct PumpParts<M> {
    ingress: mpsc::Receiver<Bytes>,
    decode: DecodeFn<M>,
    handler: Box<dyn MessageHandler<M>>,
    error_tx: mpsc::Sender<ProtocolError>,
    stop_rx: broadcast::Receiver<()>,
}

/// One running mini-protocol instance.
pub struct Protocol<M: Message> {
    name: &'static str,
    mode: Mode,
    role: Role,
    state_map: Arc<StateMap>,
    state: watch::Sender<State>,
    egress: EgressHandle,
    encode: EncodeFn<M>,
    send_gate: tokio::sync::Mutex<()>,
    started: AtomicBool,
    stop_tx: broadcast::Sender<()>,
    pump: Mutex<Option<PumpParts<M>>>,
}

impl<M: Message> Protocol<M> {
    pub fn new(
        config: ProtocolConfig<M>,
        channel: ProtocolChannel,
        error_tx: mpsc::Sender<ProtocolError>,
        handler: Box<dyn MessageHandler<M>>,
    ) -> Arc<Protocol<M>> {
        let (state, _) = watch::channel(config.initial_state);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        Arc::new(Protocol {
            name: config.name,
            mode: config.mode,
            role: config.role,
            state_map: Arc::new(config.state_map),
            state,
            egress: channel.egress,
            encode: config.encode,
            send_gate: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            stop_tx,
            pump: Mutex::new(Some(PumpParts {
                ingress: channel.ingress,
                decode: config.decode,
                handler,
                error_tx,
                stop_rx,
            })),
        })
    }

    /// Spawn the receive pump. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let parts = self
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(parts) = parts else { return };
        let proto = self.clone();
        tokio::spawn(proto.run_pump(parts));
    }

    /// Signal the receive pump to terminate. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// A watch over state transitions, e.g. to await a terminal state.
    pub fn state_watch(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Send a message. Requires local agency in the current state and a
    /// legal transition for the message type; transitions before the bytes
    /// are queued for the mux.
    pub async fn send_message(&self, msg: M) -> Result<(), ProtocolError> {
        let _gate = self.send_gate.lock().await;
        let current = *self.state.borrow();
        let next = self.check_send(current, &msg)?;
        let payload = self.encode_message(&msg)?;
        self.state.send_replace(next);
        tracing::debug!(
            protocol = self.name,
            msg_type = msg.message_type(),
            from = current.name,
            to = next.name,
            "sent message"
        );
        self.egress
            .send(Bytes::from(payload))
            .await
            .map_err(ProtocolError::Transport)
    }

    /// Send while earlier exchanges are still in flight: the message is
    /// validated as if the machine stood in `from`, and the live state is
    /// left untouched.
    pub async fn send_message_from(&self, from: State, msg: M) -> Result<(), ProtocolError> {
        let _gate = self.send_gate.lock().await;
        self.check_send(from, &msg)?;
        let payload = self.encode_message(&msg)?;
        tracing::debug!(
            protocol = self.name,
            msg_type = msg.message_type(),
            from = from.name,
            "sent pipelined message"
        );
        self.egress
            .send(Bytes::from(payload))
            .await
            .map_err(ProtocolError::Transport)
    }

    fn encode_message(&self, msg: &M) -> Result<Vec<u8>, ProtocolError> {
        (self.encode)(msg, self.mode).map_err(|e| ProtocolError::Decode {
            protocol: self.name,
            reason: format!("encode failed: {e}"),
        })
    }

    fn check_send(&self, state: State, msg: &M) -> Result<State, ProtocolError> {
        let entry = self.entry(state)?;
        if entry.agency != local_agency(self.role) {
            return Err(ProtocolError::AgencyViolation {
                protocol: self.name,
                detail: format!("cannot send in state {} ({:?} agency)", state, entry.agency),
            });
        }
        entry
            .transition(msg.message_type())
            .ok_or(ProtocolError::InvalidTransition {
                protocol: self.name,
                message_type: msg.message_type(),
                state: state.name,
            })
    }

    fn entry(&self, state: State) -> Result<&crate::StateEntry, ProtocolError> {
        self.state_map.entry(state).ok_or_else(|| {
            ProtocolError::Config(format!(
                "{}: state {state} missing from state map",
                self.name
            ))
        })
    }

    async fn run_pump(self: Arc<Self>, mut parts: PumpParts<M>) {
        tracing::debug!(protocol = self.name, role = %self.role, "receive pump started");
        match self.pump_loop(&mut parts).await {
            Ok(()) => tracing::debug!(protocol = self.name, "receive pump finished"),
            Err(e) => {
                tracing::warn!(protocol = self.name, "receive pump failed: {e}");
                let _ = parts.error_tx.send(e).await;
            }
        }
    }

    async fn pump_loop(&self, parts: &mut PumpParts<M>) -> Result<(), ProtocolError> {
        let mut state_rx = self.state.subscribe();
        let mut buffer = BytesMut::new();

        loop {
            let current = *state_rx.borrow_and_update();
            let entry = self.entry(current)?;
            match entry.agency {
                Agency::None => {
                    tracing::debug!(protocol = self.name, state = current.name, "terminal state");
                    return Ok(());
                }
                a if a == local_agency(self.role) => {
                    // Our turn to send; wait for the send path to move the
                    // machine before reading.
                    tokio::select! {
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                        _ = parts.stop_rx.recv() => return Ok(()),
                    }
                    continue;
                }
                _ => {}
            }

            let timeout = entry.timeout;
            let msg = match timeout {
                Some(limit) => {
                    match tokio::time::timeout(
                        limit,
                        read_message(self.name, self.mode, parts, &mut buffer),
                    )
                    .await
                    {
                        Ok(read) => read?,
                        Err(_) => {
                            return Err(ProtocolError::StateTimeout {
                                protocol: self.name,
                                state: current.name,
                            })
                        }
                    }
                }
                None => read_message(self.name, self.mode, parts, &mut buffer).await?,
            };
            let Some(msg) = msg else {
                // Stop requested.
                return Ok(());
            };

            let next =
                entry
                    .transition(msg.message_type())
                    .ok_or(ProtocolError::InvalidTransition {
                        protocol: self.name,
                        message_type: msg.message_type(),
                        state: current.name,
                    })?;
            self.state.send_replace(next);
            tracing::debug!(
                protocol = self.name,
                msg_type = msg.message_type(),
                from = current.name,
                to = next.name,
                "received message"
            );

            let mut ctx = HandlerContext { state: &self.state };
            parts.handler.on_message(&mut ctx, msg)?;
        }
    }
}

/// Accumulate ingress chunks until one whole message decodes. Returns
/// `Ok(None)` when stopped mid-read.
async fn read_message<M: Message>(
    name: &'static str,
    mode: Mode,
    parts: &mut PumpParts<M>,
    buffer: &mut BytesMut,
) -> Result<Option<M>, ProtocolError> {
    loop {
        if !buffer.is_empty() {
            match (parts.decode)(&buffer[..], mode) {
                Ok(Some((msg, consumed))) => {
                    buffer.advance(consumed);
                    return Ok(Some(msg));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(ProtocolError::Decode {
                        protocol: name,
                        reason: e.to_string(),
                    })
                }
            }
        }
        tokio::select! {
            chunk = parts.ingress.recv() => match chunk {
                Some(bytes) => buffer.extend_from_slice(&bytes),
                None => return Err(ProtocolError::Transport(MuxError::TransportClosed)),
            },
            _ = parts.stop_rx.recv() => return Ok(None),
        }
    }
}
