//! Pending-call table.
//!
//! Each outstanding [`Connection::call`](crate::Connection::call) owns one
//! capacity-one slot keyed by its correlation id. The read worker delivers
//! responses with `try_send`, so it never blocks on a slow or departed caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use coms_core::Envelope;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::errors::CallError;

/// Outcome of handing a response to the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A waiting call received it.
    Delivered,
    /// The call already has its response; this one was dropped.
    Duplicate,
    /// No call is waiting on this id; dropped.
    Unmatched,
}

/// Concurrency-safe map from correlation id to response slot.
#[derive(Debug)]
pub struct CorrelationTable {
    slots: DashMap<String, mpsc::Sender<Envelope>>,
    pending: AtomicUsize,
    max_pending: usize,
}

impl CorrelationTable {
    /// Create an empty table admitting at most `max_pending` calls.
    pub fn new(max_pending: usize) -> Self {
        Self {
            slots: DashMap::new(),
            pending: AtomicUsize::new(0),
            max_pending,
        }
    }

    /// Reserve a pending slot under a fresh correlation id.
    ///
    /// Fails with [`CallError::Capacity`] without touching the map when the
    /// table is full.
    pub fn register(&self) -> Result<PendingCall<'_>, CallError> {
        let max = self.max_pending;
        if self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Err(CallError::Capacity { max });
        }

        loop {
            let id = Uuid::now_v7().to_string();
            match self.slots.entry(id) {
                Entry::Occupied(_) => {}
                Entry::Vacant(vacant) => {
                    let id = vacant.key().clone();
                    let (tx, rx) = mpsc::channel(1);
                    let _ = vacant.insert(tx);
                    return Ok(PendingCall {
                        table: self,
                        id,
                        rx,
                    });
                }
            }
        }
    }

    /// Hand a response to the call waiting on its id.
    pub fn deliver(&self, response: Envelope) -> Delivery {
        let Some(slot) = self.slots.get(response.id.as_str()) else {
            return Delivery::Unmatched;
        };
        match slot.try_send(response) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Duplicate,
            Err(TrySendError::Closed(_)) => Delivery::Unmatched,
        }
    }

    /// Close every slot. Waiting calls observe [`CallError::Closed`].
    ///
    /// Returns the number of slots closed.
    pub fn drain(&self) -> usize {
        let drained = self.slots.len();
        self.slots.clear();
        drained
    }

    /// Whether a call is registered under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of reserved calls, including ones whose slot was drained but
    /// whose caller has not returned yet.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Configured maximum.
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }
}

/// One reserved call. Dropping it removes the slot and releases the
/// reservation, whatever path the call took.
#[derive(Debug)]
pub struct PendingCall<'a> {
    table: &'a CorrelationTable,
    id: String,
    rx: mpsc::Receiver<Envelope>,
}

impl PendingCall<'_> {
    /// Correlation id of this call.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response.
    pub async fn wait(mut self, timeout: Duration) -> Result<Envelope, CallError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(CallError::Closed),
            Err(_) => Err(CallError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        let _ = self.table.slots.remove(&self.id);
        let _ = self.table.pending.fetch_sub(1, Ordering::AcqRel);
    }
}
