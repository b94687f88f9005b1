//! Handshake -- one-shot protocol version negotiation.
//!
//! The client proposes a version map and the server either accepts one
//! version or refuses. Client side only; both sides run it on protocol id 0
//! before anything else moves on the connection.

use std::time::Duration;

use crate::{Agency, Mode, State, StateEntry, StateMap, Transition};

pub mod client;
pub mod messages;

pub use client::{Client, HandshakeObserver};
pub use messages::{Message, RefuseReason, VersionData};

pub const PROTOCOL_NAME: &str = "handshake";
pub const PROTOCOL_ID: u16 = 0;

pub const STATE_PROPOSE: State = State::new(1, "Propose");
pub const STATE_CONFIRM: State = State::new(2, "Confirm");
pub const STATE_DONE: State = State::new(3, "Done");

/// Deadline for the server's accept/refuse reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Node-to-node versions proposed by default. Version 11 adds a
/// peer-sharing field whose semantics are still in flux, so it is not
/// proposed.
pub const DEFAULT_VERSIONS_NTN: &[u16] = &[7, 8, 9, 10];

/// Node-to-client versions proposed by default.
pub const DEFAULT_VERSIONS_NTC: &[u16] = &[9, 10, 11, 12, 13, 14];

pub fn default_versions(mode: Mode) -> &'static [u16] {
    match mode {
        Mode::NodeToNode => DEFAULT_VERSIONS_NTN,
        Mode::NodeToClient => DEFAULT_VERSIONS_NTC,
    }
}

/// Handshake state machine.
pub fn state_map() -> StateMap {
    let mut map = StateMap::new();
    map.insert(
        STATE_PROPOSE,
        StateEntry::new(
            Agency::Client,
            vec![Transition {
                message_type: messages::MESSAGE_TYPE_PROPOSE_VERSIONS,
                next_state: STATE_CONFIRM,
            }],
        ),
    );
    map.insert(
        STATE_CONFIRM,
        StateEntry::new(
            Agency::Server,
            vec![
                Transition {
                    message_type: messages::MESSAGE_TYPE_ACCEPT_VERSION,
                    next_state: STATE_DONE,
                },
                Transition {
                    message_type: messages::MESSAGE_TYPE_REFUSE,
                    next_state: STATE_DONE,
                },
            ],
        ),
    );
    map.insert(STATE_DONE, StateEntry::new(Agency::None, vec![]));
    map
}

/// Handshake client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub protocol_versions: Vec<u16>,
    pub network_magic: u32,
    pub client_full_duplex: bool,
    pub timeout: Duration,
}

impl Config {
    pub fn new(mode: Mode, network_magic: u32) -> Config {
        Config {
            protocol_versions: default_versions(mode).to_vec(),
            network_magic,
            client_full_duplex: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_protocol_versions(mut self, versions: Vec<u16>) -> Config {
        self.protocol_versions = versions;
        self
    }

    pub fn with_full_duplex(mut self, full_duplex: bool) -> Config {
        self.client_full_duplex = full_duplex;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Config {
        self.timeout = timeout;
        self
    }
}
