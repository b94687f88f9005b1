//! Connection bootstrap.
//!
//! Sequence: wrap the stream in a muxer, register the handshake on its
//! well-known id, run it to completion, then register the application
//! protocols for the negotiated version and seal the registry. From that
//! point the mux drives everything until the first fatal error.

use std::fmt;
use std::sync::{Arc, Mutex};

use ouro_mux::{Muxer, Role};
use ouro_protocol::chainsync::{self, ChainSyncObserver};
use ouro_protocol::handshake::{self, HandshakeObserver};
use ouro_protocol::{BoxError, Mode, MuxError, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// Capacity of the shared error channel. Every protocol surfaces at most
/// one error; only the first matters.
const ERROR_CHANNEL_SIZE: usize = 8;

/// Everything the bootstrap needs to know.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub mode: Mode,
    pub handshake: handshake::Config,
    pub chainsync: chainsync::Config,
}

impl ConnectionConfig {
    pub fn new(mode: Mode, network_magic: u32) -> ConnectionConfig {
        ConnectionConfig {
            mode,
            handshake: handshake::Config::new(mode, network_magic),
            chainsync: chainsync::Config::default(),
        }
    }
}

/// A live connection after a successful handshake.
pub struct Connection {
    version: u16,
    full_duplex: bool,
    chainsync: chainsync::Client,
    muxer: Muxer,
    error_rx: mpsc::Receiver<ProtocolError>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.version)
            .field("full_duplex", &self.full_duplex)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Run the bootstrap over `stream`. Returns once the server accepted a
    /// version; on refusal or timeout the mux is shut down and the error
    /// returned.
    pub async fn connect<S>(
        stream: S,
        config: ConnectionConfig,
        observer: Arc<dyn ChainSyncObserver>,
    ) -> Result<Connection, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (muxer, mut mux_errors) = Muxer::new(stream);
        let (error_tx, mut error_rx) = mpsc::channel(ERROR_CHANNEL_SIZE);

        // Mux failures join the shared error channel.
        let forward_tx = error_tx.clone();
        tokio::spawn(async move {
            while let Some(e) = mux_errors.recv().await {
                if forward_tx.send(ProtocolError::Transport(e)).await.is_err() {
                    break;
                }
            }
        });

        match bootstrap(&muxer, &config, error_tx, &mut error_rx, observer).await {
            Ok((version, full_duplex, cs_client)) => Ok(Connection {
                version,
                full_duplex,
                chainsync: cs_client,
                muxer,
                error_rx,
            }),
            Err(e) => {
                muxer.shutdown();
                Err(e)
            }
        }
    }

    /// The protocol version the server accepted.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Whether the server granted full-duplex diffusion (node-to-node only).
    pub fn full_duplex(&self) -> bool {
        self.full_duplex
    }

    pub fn chainsync(&self) -> &chainsync::Client {
        &self.chainsync
    }

    /// Await the first fatal error on the connection. Returns `None` once
    /// every task has finished cleanly.
    pub async fn next_error(&mut self) -> Option<ProtocolError> {
        self.error_rx.recv().await
    }

    /// Stop the mux pumps; protocols observe transport closure.
    pub fn shutdown(&self) {
        tracing::info!("connection shutdown requested");
        self.muxer.shutdown();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.muxer.shutdown();
    }
}

async fn bootstrap(
    muxer: &Muxer,
    config: &ConnectionConfig,
    error_tx: mpsc::Sender<ProtocolError>,
    error_rx: &mut mpsc::Receiver<ProtocolError>,
    observer: Arc<dyn ChainSyncObserver>,
) -> Result<(u16, bool, chainsync::Client), ProtocolError> {
    let hs_channel = muxer
        .register(handshake::PROTOCOL_ID, Role::Initiator)
        .map_err(ProtocolError::Transport)?;
    let (finished_tx, mut finished_rx) = oneshot::channel();
    let hs_client = handshake::Client::new(
        config.mode,
        config.handshake.clone(),
        hs_channel,
        error_tx.clone(),
        Arc::new(FinishedSignal {
            tx: Mutex::new(Some(finished_tx)),
        }),
    )?;
    hs_client.start().await?;

    let (version, full_duplex) = tokio::select! {
        res = &mut finished_rx => match res {
            Ok(outcome) => outcome,
            // The handshake pump died without accepting; its error is on
            // the shared channel.
            Err(_) => return Err(first_error(error_rx).await),
        },
        err = error_rx.recv() => {
            return Err(err.unwrap_or(ProtocolError::Transport(MuxError::TransportClosed)));
        }
    };
    tracing::info!(mode = %config.mode, version, full_duplex, "handshake complete");

    let cs_channel = muxer
        .register(chainsync::protocol_id(config.mode), Role::Initiator)
        .map_err(ProtocolError::Transport)?;
    let cs_client = chainsync::Client::new(
        config.mode,
        config.chainsync.clone(),
        cs_channel,
        error_tx,
        observer,
    );
    muxer.seal();
    cs_client.start();

    Ok((version, full_duplex, cs_client))
}

async fn first_error(error_rx: &mut mpsc::Receiver<ProtocolError>) -> ProtocolError {
    error_rx
        .recv()
        .await
        .unwrap_or(ProtocolError::Transport(MuxError::TransportClosed))
}

/// Bridges the handshake completion callback to the bootstrap future.
struct FinishedSignal {
    tx: Mutex<Option<oneshot::Sender<(u16, bool)>>>,
}

impl HandshakeObserver for FinishedSignal {
    fn finished(&self, version: u16, full_duplex: bool) -> Result<(), BoxError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or("handshake finished twice")?;
        let _ = tx.send((version, full_duplex));
        Ok(())
    }
}
