//! Handshake client.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ouro_mux::ProtocolChannel;
use tokio::sync::mpsc;

use super::{messages, Config, Message, VersionData};
use super::{state_map, PROTOCOL_NAME, STATE_CONFIRM, STATE_PROPOSE};
use crate::runtime::{HandlerContext, MessageHandler, Protocol, ProtocolConfig};
use crate::{BoxError, Mode, ProtocolError, Role, State};

/// Completion hook. Required at construction: an accepted handshake with
/// nobody to tell is a configuration error.
pub trait HandshakeObserver: Send + Sync {
    fn finished(&self, version: u16, full_duplex: bool) -> Result<(), BoxError>;
}

/// Handshake client: proposes versions on start, then waits for the
/// server's verdict in the Confirm state.
pub struct Client {
    proto: Arc<Protocol<Message>>,
    config: Config,
    mode: Mode,
    started: AtomicBool,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("mode", &self.mode)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(
        mode: Mode,
        config: Config,
        channel: ProtocolChannel,
        error_tx: mpsc::Sender<ProtocolError>,
        observer: Arc<dyn HandshakeObserver>,
    ) -> Result<Client, ProtocolError> {
        if config.protocol_versions.is_empty() {
            return Err(ProtocolError::Config(
                "handshake: no protocol versions to propose".into(),
            ));
        }

        let mut map = state_map();
        map.set_timeout(STATE_CONFIRM, config.timeout);

        let proto = Protocol::new(
            ProtocolConfig {
                name: PROTOCOL_NAME,
                mode,
                role: Role::Initiator,
                state_map: map,
                initial_state: STATE_PROPOSE,
                decode: messages::decode,
                encode: messages::encode,
            },
            channel,
            error_tx,
            Box::new(ClientHandler { mode, observer }),
        );

        Ok(Client {
            proto,
            config,
            mode,
            started: AtomicBool::new(false),
        })
    }

    /// Start the pump and send ProposeVersions. Idempotent.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.proto.start();
        let version_map = self.version_map();
        tracing::debug!(
            mode = %self.mode,
            versions = ?version_map.keys().collect::<Vec<_>>(),
            "proposing versions"
        );
        self.proto
            .send_message(Message::ProposeVersions { version_map })
            .await
    }

    /// Signal the receive pump to terminate.
    pub fn stop(&self) {
        self.proto.stop();
    }

    pub fn state(&self) -> State {
        self.proto.state()
    }

    fn version_map(&self) -> BTreeMap<u16, VersionData> {
        self.config
            .protocol_versions
            .iter()
            .map(|&version| {
                let data = match self.mode {
                    Mode::NodeToNode => VersionData::NodeToNode {
                        network_magic: self.config.network_magic,
                        initiator_and_responder: self.config.client_full_duplex,
                    },
                    Mode::NodeToClient => VersionData::NodeToClient {
                        network_magic: self.config.network_magic,
                    },
                };
                (version, data)
            })
            .collect()
    }
}

struct ClientHandler {
    mode: Mode,
    observer: Arc<dyn HandshakeObserver>,
}

impl MessageHandler<Message> for ClientHandler {
    fn on_message(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        msg: Message,
    ) -> Result<(), ProtocolError> {
        match msg {
            Message::AcceptVersion {
                version,
                version_data,
            } => {
                let full_duplex = self.mode == Mode::NodeToNode && version_data.full_duplex();
                tracing::info!(version, full_duplex, "handshake accepted");
                self.observer
                    .finished(version, full_duplex)
                    .map_err(|e| ProtocolError::Callback {
                        protocol: PROTOCOL_NAME,
                        source: e,
                    })
            }
            Message::Refuse(reason) => {
                tracing::warn!(%reason, "handshake refused");
                Err(ProtocolError::HandshakeRefused(reason))
            }
            Message::ProposeVersions { .. } => Err(ProtocolError::AgencyViolation {
                protocol: PROTOCOL_NAME,
                detail: "server sent ProposeVersions".into(),
            }),
        }
    }
}
