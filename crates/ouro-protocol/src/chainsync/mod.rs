//! ChainSync -- streaming chain updates (client side).
//!
//! The client requests the next chain update from `Idle`; the server either
//! replies immediately (roll forward/backward) or announces a wait with
//! `AwaitReply` and owes exactly one later reply. `FindIntersect` locates a
//! common chain point before syncing. Requests may be pipelined up to a
//! configured limit.

use std::time::Duration;

use crate::{Agency, Mode, State, StateEntry, StateMap, Transition};

pub mod client;
pub mod messages;

pub use client::{ChainSyncObserver, Client, IntersectOutcome};
pub use messages::{Message, WrappedHeader};

pub const PROTOCOL_NAME: &str = "chain-sync";
pub const PROTOCOL_ID_NTN: u16 = 2;
pub const PROTOCOL_ID_NTC: u16 = 5;

pub fn protocol_id(mode: Mode) -> u16 {
    match mode {
        Mode::NodeToNode => PROTOCOL_ID_NTN,
        Mode::NodeToClient => PROTOCOL_ID_NTC,
    }
}

pub const STATE_IDLE: State = State::new(1, "Idle");
pub const STATE_CAN_AWAIT: State = State::new(2, "CanAwait");
pub const STATE_MUST_REPLY: State = State::new(3, "MustReply");
pub const STATE_INTERSECT: State = State::new(4, "Intersect");
pub const STATE_DONE: State = State::new(5, "Done");

pub const DEFAULT_INTERSECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 30-60s would be plenty on paper, but 55s gaps between blocks have been
/// observed on the preview network, so leave generous headroom.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(180);

/// ChainSync state machine. Timeouts are applied per client config.
pub fn state_map() -> StateMap {
    let mut map = StateMap::new();
    map.insert(
        STATE_IDLE,
        StateEntry::new(
            Agency::Client,
            vec![
                Transition {
                    message_type: messages::MESSAGE_TYPE_REQUEST_NEXT,
                    next_state: STATE_CAN_AWAIT,
                },
                Transition {
                    message_type: messages::MESSAGE_TYPE_FIND_INTERSECT,
                    next_state: STATE_INTERSECT,
                },
                Transition {
                    message_type: messages::MESSAGE_TYPE_DONE,
                    next_state: STATE_DONE,
                },
            ],
        ),
    );
    map.insert(
        STATE_CAN_AWAIT,
        StateEntry::new(
            Agency::Server,
            vec![
                Transition {
                    message_type: messages::MESSAGE_TYPE_AWAIT_REPLY,
                    next_state: STATE_MUST_REPLY,
                },
                Transition {
                    message_type: messages::MESSAGE_TYPE_ROLL_FORWARD,
                    next_state: STATE_IDLE,
                },
                Transition {
                    message_type: messages::MESSAGE_TYPE_ROLL_BACKWARD,
                    next_state: STATE_IDLE,
                },
            ],
        ),
    );
    map.insert(
        STATE_MUST_REPLY,
        StateEntry::new(
            Agency::Server,
            vec![
                Transition {
                    message_type: messages::MESSAGE_TYPE_ROLL_FORWARD,
                    next_state: STATE_IDLE,
                },
                Transition {
                    message_type: messages::MESSAGE_TYPE_ROLL_BACKWARD,
                    next_state: STATE_IDLE,
                },
            ],
        ),
    );
    map.insert(
        STATE_INTERSECT,
        StateEntry::new(
            Agency::Server,
            vec![
                Transition {
                    message_type: messages::MESSAGE_TYPE_INTERSECT_FOUND,
                    next_state: STATE_IDLE,
                },
                Transition {
                    message_type: messages::MESSAGE_TYPE_INTERSECT_NOT_FOUND,
                    next_state: STATE_IDLE,
                },
            ],
        ),
    );
    map.insert(STATE_DONE, StateEntry::new(Agency::None, vec![]));
    map
}

/// ChainSync client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub intersect_timeout: Duration,
    pub block_timeout: Duration,
    /// Maximum in-flight `RequestNext` messages. 0 disables pipelining.
    pub pipeline_limit: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            intersect_timeout: DEFAULT_INTERSECT_TIMEOUT,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            pipeline_limit: 0,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_intersect_timeout(mut self, timeout: Duration) -> Config {
        self.intersect_timeout = timeout;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Config {
        self.block_timeout = timeout;
        self
    }

    pub fn with_pipeline_limit(mut self, limit: usize) -> Config {
        self.pipeline_limit = limit;
        self
    }
}
