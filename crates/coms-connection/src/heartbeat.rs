//! Ping handling.
//!
//! The read worker sees pings but must never write. Each ping is handed to the
//! write worker through a small queue and pushes the shared write deadline
//! forward.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::errors::TransportError;

/// Capacity of the ping hand-off queue.
pub const PING_QUEUE: usize = 8;

/// Absolute deadline applied to every transport write. Unset until the
/// first ping.
#[derive(Clone, Debug, Default)]
pub struct WriteDeadline(Arc<Mutex<Option<Instant>>>);

impl WriteDeadline {
    /// Create an unset deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the deadline to `now + by`.
    pub fn extend(&self, by: Duration) {
        *self.0.lock() = Some(Instant::now() + by);
    }

    /// Current deadline, if any.
    pub fn get(&self) -> Option<Instant> {
        *self.0.lock()
    }

    /// Run one write under the current deadline.
    pub async fn run<F, T>(&self, write: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        match self.get() {
            Some(deadline) => tokio::time::timeout_at(deadline, write)
                .await
                .map_err(|_| TransportError::WriteTimeout)?,
            None => write.await,
        }
    }
}

/// Read-side half of the heartbeat: forwards pings to the writer.
#[derive(Debug)]
pub struct HeartbeatResponder {
    pings: mpsc::Sender<Bytes>,
    deadline: WriteDeadline,
    extend_by: Duration,
}

impl HeartbeatResponder {
    /// Create a responder and the receiver the write worker drains.
    pub fn new(deadline: WriteDeadline, extend_by: Duration) -> (Self, mpsc::Receiver<Bytes>) {
        let (pings, rx) = mpsc::channel(PING_QUEUE);
        (
            Self {
                pings,
                deadline,
                extend_by,
            },
            rx,
        )
    }

    /// Handle one ping. Returns `false` once the writer is gone.
    pub async fn on_ping(&self, payload: Bytes) -> bool {
        self.deadline.extend(self.extend_by);
        self.pings.send(payload).await.is_ok()
    }
}
