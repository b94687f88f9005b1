//! ChainSync client.
//!
//! Pipelining model: each `RequestNext` opens its own Idle -> CanAwait
//! episode. While replies are outstanding the live state stays in an
//! awaiting state, so a pipelined send is validated against `Idle` without
//! disturbing it, and a terminal reply that leaves requests outstanding
//! re-enters `CanAwait`. The in-flight counter moves on sends and on
//! terminal replies only; `AwaitReply` promises a later reply and leaves it
//! unchanged.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ouro_mux::ProtocolChannel;
use tokio::sync::{mpsc, oneshot};

use super::{messages, Config, Message};
use super::{
    state_map, PROTOCOL_NAME, STATE_CAN_AWAIT, STATE_IDLE, STATE_INTERSECT, STATE_MUST_REPLY,
};
use crate::common::{Point, Tip};
use crate::runtime::{HandlerContext, MessageHandler, Protocol, ProtocolConfig};
use crate::{BoxError, Mode, MuxError, ProtocolError, Role, State};

/// Application callbacks for chain updates. Required at construction.
pub trait ChainSyncObserver: Send + Sync {
    /// A new header extends the chain. `era` discriminates the header
    /// format; `header` is the raw payload as received.
    fn roll_forward(&self, era: u64, header: &[u8], tip: &Tip) -> Result<(), BoxError>;

    /// The chain rolled back to `point`.
    fn roll_backward(&self, point: &Point, tip: &Tip) -> Result<(), BoxError>;
}

/// Result of a `FindIntersect` exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntersectOutcome {
    Found { point: Point, tip: Tip },
    NotFound { tip: Tip },
}

struct Shared {
    in_flight: AtomicUsize,
    intersect: Mutex<Option<oneshot::Sender<IntersectOutcome>>>,
}

/// ChainSync client with optional pipelining.
pub struct Client {
    proto: Arc<Protocol<Message>>,
    shared: Arc<Shared>,
    pipeline_limit: usize,
    // Serializes the public operations so in-flight accounting and the
    // intersect slot stay consistent.
    api_gate: tokio::sync::Mutex<()>,
}

impl Client {
    pub fn new(
        mode: Mode,
        config: Config,
        channel: ProtocolChannel,
        error_tx: mpsc::Sender<ProtocolError>,
        observer: Arc<dyn ChainSyncObserver>,
    ) -> Client {
        let mut map = state_map();
        map.set_timeout(STATE_INTERSECT, config.intersect_timeout);
        map.set_timeout(STATE_CAN_AWAIT, config.block_timeout);
        map.set_timeout(STATE_MUST_REPLY, config.block_timeout);

        let shared = Arc::new(Shared {
            in_flight: AtomicUsize::new(0),
            intersect: Mutex::new(None),
        });

        let proto = Protocol::new(
            ProtocolConfig {
                name: PROTOCOL_NAME,
                mode,
                role: Role::Initiator,
                state_map: map,
                initial_state: STATE_IDLE,
                decode: messages::decode,
                encode: messages::encode,
            },
            channel,
            error_tx,
            Box::new(ClientHandler {
                shared: shared.clone(),
                observer,
            }),
        );

        Client {
            proto,
            shared,
            pipeline_limit: config.pipeline_limit,
            api_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawn the receive pump. Idempotent; ChainSync opens with no message
    /// since the client already holds agency in `Idle`.
    pub fn start(&self) {
        self.proto.start();
    }

    /// Signal the receive pump to terminate.
    pub fn stop(&self) {
        self.proto.stop();
    }

    pub fn state(&self) -> State {
        self.proto.state()
    }

    /// Outstanding `RequestNext` messages.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Request the next chain update. The reply arrives through the
    /// observer. With pipelining enabled, up to `pipeline_limit` requests
    /// may be outstanding at once.
    pub async fn request_next(&self) -> Result<(), ProtocolError> {
        let _gate = self.api_gate.lock().await;
        let in_flight = self.shared.in_flight.load(Ordering::SeqCst);
        let limit = self.pipeline_limit.max(1);
        if in_flight >= limit {
            return Err(ProtocolError::AgencyViolation {
                protocol: PROTOCOL_NAME,
                detail: format!("pipeline limit {limit} reached"),
            });
        }

        if in_flight == 0 {
            self.proto.send_message(Message::RequestNext).await?;
        } else {
            self.proto
                .send_message_from(STATE_IDLE, Message::RequestNext)
                .await?;
        }
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Locate the best common point among `points` (typically spaced
    /// exponentially back from tip). The protocol stays usable after a
    /// `NotFound`; retry with other points or terminate with [`Client::done`].
    pub async fn find_intersect(
        &self,
        points: Vec<Point>,
    ) -> Result<IntersectOutcome, ProtocolError> {
        let _gate = self.api_gate.lock().await;
        if self.shared.in_flight.load(Ordering::SeqCst) != 0 {
            return Err(ProtocolError::AgencyViolation {
                protocol: PROTOCOL_NAME,
                detail: "cannot find intersect with requests outstanding".into(),
            });
        }

        let (tx, rx) = oneshot::channel();
        *lock_intersect(&self.shared) = Some(tx);

        self.proto
            .send_message(Message::FindIntersect { points })
            .await?;

        // The sender is dropped if the protocol fails before replying; the
        // real error is on the shared error channel.
        rx.await
            .map_err(|_| ProtocolError::Transport(MuxError::TransportClosed))
    }

    /// Terminate the protocol. Only legal from `Idle` with no replies
    /// outstanding.
    pub async fn done(&self) -> Result<(), ProtocolError> {
        let _gate = self.api_gate.lock().await;
        if self.shared.in_flight.load(Ordering::SeqCst) != 0 {
            return Err(ProtocolError::AgencyViolation {
                protocol: PROTOCOL_NAME,
                detail: "cannot finish with requests outstanding".into(),
            });
        }
        self.proto.send_message(Message::Done).await
    }
}

fn lock_intersect(
    shared: &Shared,
) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<IntersectOutcome>>> {
    shared.intersect.lock().unwrap_or_else(|e| e.into_inner())
}

struct ClientHandler {
    shared: Arc<Shared>,
    observer: Arc<dyn ChainSyncObserver>,
}

impl ClientHandler {
    /// Account for a terminal reply: decrement the in-flight counter and,
    /// if requests remain outstanding, re-enter the awaiting state.
    fn finish_reply(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ProtocolError> {
        let previous = self
            .shared
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .map_err(|_| ProtocolError::AgencyViolation {
                protocol: PROTOCOL_NAME,
                detail: "reply with no outstanding request".into(),
            })?;
        if previous > 1 {
            ctx.set_state(STATE_CAN_AWAIT);
        }
        Ok(())
    }

    fn callback_err(e: BoxError) -> ProtocolError {
        ProtocolError::Callback {
            protocol: PROTOCOL_NAME,
            source: e,
        }
    }
}

impl MessageHandler<Message> for ClientHandler {
    fn on_message(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: Message,
    ) -> Result<(), ProtocolError> {
        match msg {
            Message::AwaitReply => {
                // The server owes exactly one roll forward/backward; nothing
                // to account yet.
                Ok(())
            }
            Message::RollForward { header, tip } => {
                self.finish_reply(ctx)?;
                self.observer
                    .roll_forward(header.era, &header.payload, &tip)
                    .map_err(Self::callback_err)
            }
            Message::RollBackward { point, tip } => {
                self.finish_reply(ctx)?;
                self.observer
                    .roll_backward(&point, &tip)
                    .map_err(Self::callback_err)
            }
            Message::IntersectFound { point, tip } => {
                if let Some(tx) = lock_intersect(&self.shared).take() {
                    let _ = tx.send(IntersectOutcome::Found { point, tip });
                }
                Ok(())
            }
            Message::IntersectNotFound { tip } => {
                if let Some(tx) = lock_intersect(&self.shared).take() {
                    let _ = tx.send(IntersectOutcome::NotFound { tip });
                }
                Ok(())
            }
            Message::RequestNext | Message::FindIntersect { .. } | Message::Done => {
                Err(ProtocolError::AgencyViolation {
                    protocol: PROTOCOL_NAME,
                    detail: "server sent a client message".into(),
                })
            }
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        // The pump is going away; wake any waiter rather than leaving it
        // parked on a reply that can no longer arrive.
        lock_intersect(&self.shared).take();
    }
}
