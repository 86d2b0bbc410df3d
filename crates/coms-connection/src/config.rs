//! Per-connection configuration.

use std::time::Duration;

use coms_settings::ConnectionSettings;

/// Configuration supplied to every [`Connection`](crate::Connection) at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How far each received ping pushes the write deadline.
    pub ping_period: Duration,
    /// How long a [`call`](crate::Connection::call) waits for its response.
    pub pong_wait: Duration,
    /// Maximum outstanding outbound calls.
    pub max_pending_calls: usize,
    /// Capacity of the outbound frame queue feeding the write worker.
    pub outbound_capacity: usize,
    /// Maximum time an action handler may run before an error response is sent.
    pub handler_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for ConnectionConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            ping_period: settings.ping_period(),
            pong_wait: settings.pong_wait(),
            max_pending_calls: settings.max_pending_calls.max(1),
            outbound_capacity: settings.outbound_capacity.max(1),
            handler_timeout: settings.handler_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_settings_defaults() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.pong_wait, Duration::from_secs(60));
        assert_eq!(cfg.ping_period, Duration::from_secs(54));
        assert_eq!(cfg.max_pending_calls, 64);
        assert_eq!(cfg.outbound_capacity, 256);
    }

    #[test]
    fn zero_capacities_are_clamped() {
        let settings = ConnectionSettings {
            max_pending_calls: 0,
            outbound_capacity: 0,
            ..ConnectionSettings::default()
        };
        let cfg = ConnectionConfig::from(&settings);
        assert_eq!(cfg.max_pending_calls, 1);
        assert_eq!(cfg.outbound_capacity, 1);
    }
}
