//! Ouro Net -- connection bootstrap for the Ouroboros mini-protocols.
//!
//! Wires a duplex byte stream to a multiplexer, runs the handshake to
//! completion, then starts the application protocols for the negotiated
//! version and hands the connection to the caller.

pub mod connection;
pub mod networks;

pub use connection::{Connection, ConnectionConfig};
pub use networks::Network;

// Re-exports so applications rarely need the lower crates directly.
pub use ouro_protocol::chainsync::{ChainSyncObserver, IntersectOutcome};
pub use ouro_protocol::common::{Point, Tip};
pub use ouro_protocol::{chainsync, handshake, Mode, ProtocolError};
