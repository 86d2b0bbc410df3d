//! Settings types. Serialized as camelCase JSON.

use std::time::Duration;

use coms_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComsSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Per-connection settings.
    pub connection: ConnectionSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            max_connections: 1024,
        }
    }
}

/// Per-connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Expected interval between peer pings, in milliseconds.
    pub ping_period_ms: u64,
    /// How long to wait for a pong or a call response, in milliseconds.
    pub pong_wait_ms: u64,
    /// Maximum outstanding outbound calls per connection.
    pub max_pending_calls: usize,
    /// Capacity of the outbound frame queue.
    pub outbound_capacity: usize,
    /// Maximum time an action handler may run, in milliseconds.
    pub handler_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_period_ms: 54_000,
            pong_wait_ms: 60_000,
            max_pending_calls: 64,
            outbound_capacity: 256,
            handler_timeout_ms: 60_000,
        }
    }
}

impl ConnectionSettings {
    /// Ping period as a [`Duration`].
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    /// Pong/read wait as a [`Duration`].
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
        }
    }
}
