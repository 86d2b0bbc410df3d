//! # coms-connection
//!
//! The per-connection engine: one [`Connection`] per duplex transport, driven by
//! a read worker and a write worker, with correlated [`Connection::call`]s
//! multiplexed over the same socket.
//!
//! - [`transport`]: frame-level capability set plus WebSocket and in-memory adapters
//! - [`correlation`]: pending-call table keyed by correlation id
//! - [`heartbeat`]: ping hand-off to the writer and the write deadline
//! - [`registry`]: action handlers
//! - [`hub`]: the host-side connection set

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod correlation;
pub mod errors;
pub mod heartbeat;
pub mod hub;
pub mod registry;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState, Driver};
pub use errors::{CallError, HubError, TransportError};
pub use hub::{ConnectionSet, Hub};
pub use registry::{Handler, HandlerRegistry};
