//! Connection-layer error types.

use std::time::Duration;

use coms_core::EnvelopeError;
use thiserror::Error;

/// Failure of the underlying frame transport. Always fatal to the connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Reading the next frame failed.
    #[error("transport read failed: {0}")]
    Read(String),
    /// Writing a frame failed.
    #[error("transport write failed: {0}")]
    Write(String),
    /// The write deadline passed before the frame was written.
    #[error("write deadline exceeded")]
    WriteTimeout,
    /// The transport is already closed.
    #[error("transport closed")]
    Closed,
}

/// Failure of a single [`Connection::call`](crate::Connection::call).
///
/// Local to the caller; never affects the connection's lifecycle.
#[derive(Debug, Error)]
pub enum CallError {
    /// The connection already has the maximum number of calls outstanding.
    #[error("max pending calls exceeded ({max})")]
    Capacity {
        /// Configured maximum.
        max: usize,
    },
    /// No response arrived within the read wait.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,
    /// The request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[from] EnvelopeError),
    /// The response payload did not match the expected type.
    #[error("failed to decode response payload: {0}")]
    Decode(#[source] serde_json::Error),
    /// The peer answered with an error response.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Error code from the peer.
        code: String,
        /// Error message from the peer.
        message: String,
    },
}

impl CallError {
    /// Whether the call gave up waiting for a response.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Failure of a host-level operation on the [`Hub`](crate::Hub).
#[derive(Debug, Error)]
pub enum HubError {
    /// No connection with this id is registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    /// Dialing a remote endpoint failed.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Target URL.
        url: String,
        /// Underlying failure.
        message: String,
    },
    /// The routed call failed.
    #[error(transparent)]
    Call(#[from] CallError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_display() {
        let err = CallError::Capacity { max: 4 };
        assert_eq!(err.to_string(), "max pending calls exceeded (4)");
    }

    #[test]
    fn timeout_is_timeout() {
        assert!(CallError::Timeout(Duration::from_secs(2)).is_timeout());
        assert!(!CallError::Closed.is_timeout());
    }

    #[test]
    fn remote_display() {
        let err = CallError::Remote {
            code: "ACTION_NOT_FOUND".into(),
            message: "no handler for 'x'".into(),
        };
        assert!(err.to_string().contains("ACTION_NOT_FOUND"));
    }

    #[test]
    fn hub_error_wraps_call_error() {
        let err: HubError = CallError::Closed.into();
        assert_eq!(err.to_string(), "connection closed");
    }
}
