//! Ouro Protocol -- mini-protocol state machines over the segment mux.
//!
//! Each mini-protocol is a strictly-typed conversation: a state map with
//! agency (whose turn it is to send), a CBOR message codec, and a receive
//! pump that validates every inbound message against the machine before
//! handing it to the registered handler. Handshake and ChainSync clients
//! are built on the shared runtime in [`runtime`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub mod chainsync;
pub mod common;
pub mod handshake;
pub mod runtime;

pub use ouro_mux::{MuxError, Role};

/// Errors produced by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Connection flavor. Decides which protocol ids are in play and the exact
/// shape of handshake version data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    NodeToNode,
    NodeToClient,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::NodeToNode => "node-to-node",
            Mode::NodeToClient => "node-to-client",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which party may send from a given state. `None` marks a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agency {
    Client,
    Server,
    None,
}

/// The agency a role exercises locally: initiators hold client agency,
/// responders server agency.
pub fn local_agency(role: Role) -> Agency {
    match role {
        Role::Initiator => Agency::Client,
        Role::Responder => Agency::Server,
    }
}

/// A named protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct State {
    pub id: u8,
    pub name: &'static str,
}

impl State {
    pub const fn new(id: u8, name: &'static str) -> State {
        State { id, name }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// One permitted transition out of a state.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub message_type: u8,
    pub next_state: State,
}

/// Per-state entry: who may send, where each message type leads, and an
/// optional deadline for states where the peer holds agency.
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub agency: Agency,
    pub transitions: Vec<Transition>,
    pub timeout: Option<Duration>,
}

impl StateEntry {
    pub fn new(agency: Agency, transitions: Vec<Transition>) -> StateEntry {
        StateEntry {
            agency,
            transitions,
            timeout: None,
        }
    }

    /// Resolve a message type to the next state, if it is a legal move.
    pub fn transition(&self, message_type: u8) -> Option<State> {
        self.transitions
            .iter()
            .find(|t| t.message_type == message_type)
            .map(|t| t.next_state)
    }
}

/// Immutable description of a protocol's state machine. Built once at
/// construction and shared by the send path and the receive pump.
#[derive(Debug, Clone, Default)]
pub struct StateMap {
    entries: HashMap<u8, StateEntry>,
}

impl StateMap {
    pub fn new() -> StateMap {
        StateMap::default()
    }

    pub fn insert(&mut self, state: State, entry: StateEntry) {
        self.entries.insert(state.id, entry);
    }

    pub fn entry(&self, state: State) -> Option<&StateEntry> {
        self.entries.get(&state.id)
    }

    /// Set the timeout for one state, e.g. to apply a configured deadline
    /// before handing the map to the runtime.
    pub fn set_timeout(&mut self, state: State, timeout: Duration) {
        if let Some(entry) = self.entries.get_mut(&state.id) {
            entry.timeout = Some(timeout);
        }
    }
}

/// Implemented by each protocol's message enum.
pub trait Message: fmt::Debug + Send + 'static {
    /// The wire discriminant, i.e. the first element of the tagged array.
    fn message_type(&self) -> u8;
}

/// Codec failure while encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

impl From<minicbor::decode::Error> for CodecError {
    fn from(e: minicbor::decode::Error) -> Self {
        CodecError(e.to_string())
    }
}

/// One error taxonomy across the core. The first error published on the
/// shared channel terminates the connection; no local recovery is
/// attempted.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] MuxError),
    #[error("{protocol}: decode error: {reason}")]
    Decode {
        protocol: &'static str,
        reason: String,
    },
    #[error("{protocol}: message type {message_type} is not a valid transition from state {state}")]
    InvalidTransition {
        protocol: &'static str,
        message_type: u8,
        state: &'static str,
    },
    #[error("{protocol}: agency violation: {detail}")]
    AgencyViolation {
        protocol: &'static str,
        detail: String,
    },
    #[error("{protocol}: timeout waiting in state {state}")]
    StateTimeout {
        protocol: &'static str,
        state: &'static str,
    },
    #[error("handshake refused: {0}")]
    HandshakeRefused(handshake::RefuseReason),
    #[error("{protocol}: callback error: {source}")]
    Callback {
        protocol: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("configuration error: {0}")]
    Config(String),
}
