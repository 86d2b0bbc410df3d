//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use coms_connection::Hub;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default time allowed for connections and tasks to wind down.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Stops the listener, closes every connection and waits for the tail.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token tripped when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token, send a close to every connection in `hub`, then wait
    /// up to `timeout` for `handles` to finish and the hub to empty.
    pub async fn graceful_shutdown(
        &self,
        hub: &Hub,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        info!(
            task_count = handles.len(),
            connections = hub.count(),
            timeout_secs = timeout.as_secs(),
            "shutting down"
        );
        hub.close_all();

        let drain = async {
            let _ = futures::future::join_all(handles).await;
            hub.wait_empty().await;
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                connections = hub.count(),
                "shutdown timed out after {timeout:?}, some connections may still be open"
            );
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
