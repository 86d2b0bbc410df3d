//! # coms-server
//!
//! Axum host for coms connections.
//!
//! - `GET /ws`: upgrade to a [`Connection`](coms_connection::Connection) registered with the [`Hub`](coms_connection::Hub)
//! - `GET /health`: liveness and connection count
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod server;
pub mod shutdown;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::ComsServer;
pub use shutdown::ShutdownCoordinator;
