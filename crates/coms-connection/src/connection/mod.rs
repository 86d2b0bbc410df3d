//! The connection actor.
//!
//! A [`Connection`] is the shared handle: callers use it to [`call`](Connection::call)
//! the peer, handlers receive it with each request. The [`Driver`] owns the
//! receiving ends of the internal channels and, once given a transport, runs
//! the two workers:
//!
//! - the read worker decodes frames, resolves pending calls, dispatches
//!   requests and forwards pings
//! - the write worker is the only code that touches the writer half
//!
//! Closing is one-way: `Open -> Closing` on the first close raise from any
//! source, `Closing -> Closed` once both workers have exited, at which point
//! the host's [`ConnectionSet`] is told exactly once.

mod reader;
mod writer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use bytes::Bytes;
use coms_core::{Envelope, EnvelopeError};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::correlation::CorrelationTable;
use crate::errors::CallError;
use crate::heartbeat::{HeartbeatResponder, WriteDeadline};
use crate::hub::ConnectionSet;
use crate::registry::HandlerRegistry;
use crate::transport::Transport;

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Reading, writing and accepting calls.
    Open = 0,
    /// A close was raised; workers are winding down.
    Closing = 1,
    /// Both workers exited and the host was notified.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Shared handle to one live connection.
pub struct Connection {
    id: String,
    state: AtomicU8,
    config: ConnectionConfig,
    handlers: Arc<HandlerRegistry>,
    host: Arc<dyn ConnectionSet>,
    calls: CorrelationTable,
    outbound: mpsc::Sender<String>,
    close_tx: mpsc::Sender<()>,
    heartbeat: HeartbeatResponder,
    /// Tripped when the write worker exits.
    stopped: CancellationToken,
    /// Tripped when the connection reaches `Closed`.
    finished: CancellationToken,
    connected_at: Instant,
}

/// Receiving ends of a connection's internal channels, waiting for a
/// transport.
pub struct Driver {
    connection: Arc<Connection>,
    outbound: mpsc::Receiver<String>,
    pings: mpsc::Receiver<Bytes>,
    close: mpsc::Receiver<()>,
    deadline: WriteDeadline,
}

impl Connection {
    /// Create a connection handle and the driver that will run it.
    pub fn new(
        id: impl Into<String>,
        config: ConnectionConfig,
        handlers: Arc<HandlerRegistry>,
        host: Arc<dyn ConnectionSet>,
    ) -> (Arc<Self>, Driver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (close_tx, close_rx) = mpsc::channel(1);
        let deadline = WriteDeadline::new();
        let (heartbeat, pings) = HeartbeatResponder::new(deadline.clone(), config.ping_period);

        let connection = Arc::new(Self {
            id: id.into(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            calls: CorrelationTable::new(config.max_pending_calls.max(1)),
            config,
            handlers,
            host,
            outbound: outbound_tx,
            close_tx,
            heartbeat,
            stopped: CancellationToken::new(),
            finished: CancellationToken::new(),
            connected_at: Instant::now(),
        });
        let driver = Driver {
            connection: Arc::clone(&connection),
            outbound: outbound_rx,
            pings,
            close: close_rx,
            deadline,
        };
        (connection, driver)
    }

    /// Create a connection and start its workers on `transport`.
    pub fn spawn<T: Transport>(
        id: impl Into<String>,
        config: ConnectionConfig,
        handlers: Arc<HandlerRegistry>,
        host: Arc<dyn ConnectionSet>,
        transport: T,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (connection, driver) = Self::new(id, config, handlers, host);
        (connection, driver.spawn(transport))
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection still accepts calls.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Configuration this connection was built with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Number of outbound calls currently reserved.
    pub fn pending_calls(&self) -> usize {
        self.calls.pending_count()
    }

    /// Time since the connection was created.
    pub fn age(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Call `action` on the peer and wait for its response.
    ///
    /// Waits at most the configured pong wait. An error response from the
    /// peer is returned as [`CallError::Remote`].
    pub async fn call(
        &self,
        action: &str,
        payload: impl Serialize + Send,
    ) -> Result<Envelope, CallError> {
        let result = self.call_inner(action, payload).await;
        counter!("coms_calls_total", "action" => action.to_owned()).increment(1);
        if let Err(err) = &result {
            let kind = match err {
                CallError::Capacity { .. } => "capacity",
                CallError::Timeout(_) => "timeout",
                CallError::Closed => "closed",
                CallError::Encode(_) | CallError::Decode(_) => "encode",
                CallError::Remote { .. } => "remote",
            };
            counter!("coms_call_errors_total", "action" => action.to_owned(), "error_type" => kind)
                .increment(1);
        }
        result
    }

    async fn call_inner(
        &self,
        action: &str,
        payload: impl Serialize + Send,
    ) -> Result<Envelope, CallError> {
        if !self.is_open() {
            return Err(CallError::Closed);
        }
        let data = serde_json::to_value(payload).map_err(EnvelopeError::from)?;

        let pending = self.calls.register()?;
        // a drain may have run between the state check and the insert
        if !self.is_open() {
            return Err(CallError::Closed);
        }

        let text = Envelope::request(pending.id(), action, data).encode()?;
        debug!(connection_id = %self.id, call_id = pending.id(), action, "sending call");
        self.outbound
            .send(text)
            .await
            .map_err(|_| CallError::Closed)?;

        let mut response = pending.wait(self.config.pong_wait).await?;
        if let Some(body) = response.error.take() {
            return Err(CallError::Remote {
                code: body.code,
                message: body.message,
            });
        }
        Ok(response)
    }

    /// Call `action` and decode the response payload as `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        action: &str,
        payload: impl Serialize + Send,
    ) -> Result<T, CallError> {
        self.call(action, payload)
            .await?
            .payload()
            .map_err(CallError::Decode)
    }

    /// Send a request without waiting for its response.
    ///
    /// Whatever the peer answers is dropped as unmatched.
    pub async fn notify(&self, action: &str, payload: impl Serialize + Send) -> Result<(), CallError> {
        if !self.is_open() {
            return Err(CallError::Closed);
        }
        let data = serde_json::to_value(payload).map_err(EnvelopeError::from)?;
        let text = Envelope::request(Uuid::now_v7().to_string(), action, data).encode()?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| CallError::Closed)
    }

    /// Start closing the connection. Repeated calls are no-ops.
    pub fn close(&self) {
        self.raise_close();
    }

    /// Wait until the connection reaches [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    /// First raise moves `Open -> Closing` and drains pending calls; every
    /// raise nudges the write worker.
    fn raise_close(&self) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let drained = self.calls.drain();
            debug!(connection_id = %self.id, drained, "connection closing");
        }
        // capacity one: a pending signal already says everything
        let _ = self.close_tx.try_send(());
    }

    /// Terminal transition. Runs its body once.
    fn finish(&self) {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return;
        }
        let _ = self.calls.drain();
        self.host.remove(&self.id);
        self.finished.cancel();

        gauge!("coms_connections_active").decrement(1.0);
        histogram!("coms_connection_duration_seconds").record(self.age().as_secs_f64());
        info!(connection_id = %self.id, "connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Connection this driver runs.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Split `transport` and run both workers plus a supervisor that
    /// performs the terminal transition once both have exited.
    pub fn spawn<T: Transport>(self, transport: T) -> JoinHandle<()> {
        let Self {
            connection,
            outbound,
            pings,
            close,
            deadline,
        } = self;
        let (frame_reader, frame_writer) = transport.into_split();

        info!(connection_id = %connection.id, "connection opened");
        counter!("coms_connections_total").increment(1);
        gauge!("coms_connections_active").increment(1.0);

        let read_task = tokio::spawn(reader::run(Arc::clone(&connection), frame_reader));
        let write_task = tokio::spawn(writer::run(
            Arc::clone(&connection),
            frame_writer,
            writer::Inputs {
                outbound,
                pings,
                close,
                deadline,
            },
        ));

        tokio::spawn(async move {
            if let Err(e) = read_task.await {
                warn!(connection_id = %connection.id, error = %e, "read worker failed");
                connection.raise_close();
            }
            if let Err(e) = write_task.await {
                warn!(connection_id = %connection.id, error = %e, "write worker failed");
            }
            connection.finish();
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use coms_core::HandlerError;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::registry::Handler;
    use crate::transport::mem::{self, MemoryPeer};
    use crate::transport::{Frame, NORMAL_CLOSURE};

    #[derive(Default)]
    struct CountingHost {
        removed: Mutex<Vec<String>>,
    }

    impl CountingHost {
        fn removed(&self) -> Vec<String> {
            self.removed.lock().clone()
        }
    }

    impl ConnectionSet for CountingHost {
        fn remove(&self, connection_id: &str) {
            self.removed.lock().push(connection_id.to_owned());
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(
            &self,
            _connection: &Arc<Connection>,
            request: &Envelope,
        ) -> Result<Value, HandlerError> {
            Ok(request.data.clone())
        }
    }

    struct SleepyHandler;

    #[async_trait]
    impl Handler for SleepyHandler {
        async fn handle(
            &self,
            _connection: &Arc<Connection>,
            request: &Envelope,
        ) -> Result<Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(request.data.clone())
        }
    }

    struct FailHandler;

    #[async_trait]
    impl Handler for FailHandler {
        async fn handle(
            &self,
            _connection: &Arc<Connection>,
            _request: &Envelope,
        ) -> Result<Value, HandlerError> {
            Err(HandlerError::NotAvailable {
                message: "offline".into(),
            })
        }
    }

    struct Harness {
        conn: Arc<Connection>,
        peer: MemoryPeer,
        host: Arc<CountingHost>,
        task: JoinHandle<()>,
    }

    fn start(config: ConnectionConfig) -> Harness {
        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", EchoHandler);
        handlers.register("sleepy", SleepyHandler);
        handlers.register("fail", FailHandler);

        let (transport, peer) = mem::pair(64);
        let host = Arc::new(CountingHost::default());
        let (conn, task) = Connection::spawn(
            "conn_test",
            config,
            Arc::new(handlers),
            host.clone(),
            transport,
        );
        Harness {
            conn,
            peer,
            host,
            task,
        }
    }

    /// Send a request through the peer and wait for its response. Everything
    /// the peer sent earlier has been processed once this returns.
    async fn round_trip(peer: &mut MemoryPeer, id: &str) -> Envelope {
        peer.send_envelope(&Envelope::request(id, "echo", json!({"sync": id})))
            .await;
        peer.next_envelope().await.unwrap()
    }

    #[tokio::test]
    async fn concurrent_calls_answered_out_of_order() {
        let mut h = start(ConnectionConfig::default());

        let mut calls = Vec::new();
        for n in 0..5 {
            let conn = Arc::clone(&h.conn);
            calls.push(tokio::spawn(async move {
                conn.call("echo", json!({ "n": n })).await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..5 {
            requests.push(h.peer.next_envelope().await.unwrap());
        }
        for req in requests.iter().rev() {
            h.peer
                .send_envelope(&Envelope::response_to(req, req.data.clone()))
                .await;
        }

        for (n, call) in calls.into_iter().enumerate() {
            let resp = call.await.unwrap().unwrap();
            assert_eq!(resp.data, json!({ "n": n }));
        }
        assert_eq!(h.conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn capacity_rejects_extra_call() {
        let config = ConnectionConfig {
            max_pending_calls: 2,
            ..ConnectionConfig::default()
        };
        let mut h = start(config);

        for n in 0..2 {
            let conn = Arc::clone(&h.conn);
            drop(tokio::spawn(async move {
                conn.call("echo", json!({ "n": n })).await
            }));
        }
        let _ = h.peer.next_envelope().await.unwrap();
        let _ = h.peer.next_envelope().await.unwrap();
        assert_eq!(h.conn.pending_calls(), 2);

        let err = h.conn.call("echo", json!({"n": 3})).await.unwrap_err();
        assert!(matches!(err, CallError::Capacity { max: 2 }));
        assert_eq!(h.conn.pending_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_and_late_response_is_dropped() {
        let config = ConnectionConfig {
            pong_wait: Duration::from_secs(2),
            ..ConnectionConfig::default()
        };
        let mut h = start(config);

        let started = tokio::time::Instant::now();
        let err = h.conn.call("echo", json!({"x": 1})).await.unwrap_err();
        assert!(err.is_timeout());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_secs(3));
        assert_eq!(h.conn.pending_calls(), 0);

        let req = h.peer.next_envelope().await.unwrap();
        assert_eq!(req.action, "echo");
        h.peer
            .send_envelope(&Envelope::response_to(&req, json!({"x": 1})))
            .await;

        let sync = round_trip(&mut h.peer, "sync-1").await;
        assert_eq!(sync.id, "sync-1");
        assert_eq!(h.conn.pending_calls(), 0);
        assert!(h.conn.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn responses_follow_request_order() {
        let mut h = start(ConnectionConfig::default());

        h.peer
            .send_envelope(&Envelope::request("a", "sleepy", json!("A")))
            .await;
        h.peer
            .send_envelope(&Envelope::request("b", "echo", json!("B")))
            .await;

        let first = h.peer.next_envelope().await.unwrap();
        let second = h.peer.next_envelope().await.unwrap();
        assert_eq!((first.id.as_str(), first.data), ("a", json!("A")));
        assert_eq!((second.id.as_str(), second.data), ("b", json!("B")));
    }

    #[tokio::test]
    async fn each_ping_yields_one_pong() {
        let mut h = start(ConnectionConfig::default());

        for payload in ["1", "2", "3"] {
            h.peer.send_ping(Bytes::from_static(payload.as_bytes())).await;
        }
        for payload in ["1", "2", "3"] {
            assert_eq!(
                h.peer.next_frame().await,
                Some(Frame::Pong(Bytes::from_static(payload.as_bytes())))
            );
        }

        h.peer
            .send_envelope(&Envelope::request("after", "echo", json!(null)))
            .await;
        match h.peer.next_frame().await {
            Some(Frame::Text(text)) => {
                let resp = Envelope::decode(&text).unwrap().unwrap();
                assert_eq!(resp.id, "after");
            }
            other => panic!("expected the response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_failures_close_once() {
        let mut h = start(ConnectionConfig::default());
        h.peer.fail_writes(true);

        let conn = Arc::clone(&h.conn);
        let call = tokio::spawn(async move { conn.call("echo", json!(1)).await });
        h.peer.inject_read_error("reset by peer").await;
        h.conn.close();

        h.task.await.unwrap();
        assert!(matches!(call.await.unwrap(), Err(CallError::Closed)));
        assert_eq!(h.conn.state(), ConnectionState::Closed);
        assert_eq!(h.host.removed(), vec!["conn_test".to_owned()]);
        assert!(h.peer.was_force_closed());
    }

    #[tokio::test]
    async fn malformed_frame_closes_and_deregisters_once() {
        let mut h = start(ConnectionConfig::default());

        h.peer.send_text("{not json").await;

        assert_eq!(
            h.peer.next_frame().await,
            Some(Frame::Close(Some(NORMAL_CLOSURE)))
        );
        h.task.await.unwrap();
        assert_eq!(h.conn.state(), ConnectionState::Closed);
        assert_eq!(h.host.removed(), vec!["conn_test".to_owned()]);

        h.conn.close();
        assert_eq!(h.host.removed().len(), 1);
    }

    #[tokio::test]
    async fn close_drains_pending_calls() {
        let mut h = start(ConnectionConfig::default());

        let conn = Arc::clone(&h.conn);
        let call = tokio::spawn(async move { conn.call("echo", json!(1)).await });
        let _ = h.peer.next_envelope().await.unwrap();

        h.conn.close();
        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CallError::Closed)));

        h.conn.closed().await;
        assert_eq!(h.conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn call_after_close_fails_fast() {
        let h = start(ConnectionConfig::default());
        h.conn.close();
        assert!(!h.conn.is_open());
        assert!(matches!(
            h.conn.call("echo", json!(1)).await,
            Err(CallError::Closed)
        ));
        assert!(matches!(
            h.conn.notify("echo", json!(1)).await,
            Err(CallError::Closed)
        ));
    }

    #[tokio::test]
    async fn unknown_action_gets_error_response() {
        let mut h = start(ConnectionConfig::default());

        h.peer
            .send_envelope(&Envelope::request("u1", "no.such", json!(null)))
            .await;
        let resp = h.peer.next_envelope().await.unwrap();
        assert_eq!(resp.id, "u1");
        assert_eq!(resp.action, "no.such");
        assert_eq!(resp.error.unwrap().code, "ACTION_NOT_FOUND");
        assert!(h.conn.is_open());
    }

    #[tokio::test]
    async fn handler_failure_keeps_its_code() {
        let mut h = start(ConnectionConfig::default());

        h.peer
            .send_envelope(&Envelope::request("f1", "fail", json!(null)))
            .await;
        let resp = h.peer.next_envelope().await.unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, "NOT_AVAILABLE");
        assert_eq!(err.message, "offline");
        assert!(h.conn.is_open());
    }

    #[tokio::test]
    async fn remote_error_surfaces_to_caller() {
        let mut h = start(ConnectionConfig::default());

        let conn = Arc::clone(&h.conn);
        let call = tokio::spawn(async move { conn.call("missing", json!(null)).await });
        let req = h.peer.next_envelope().await.unwrap();
        h.peer
            .send_envelope(&Envelope::error_response(&req, "ACTION_NOT_FOUND", "nope"))
            .await;

        match call.await.unwrap() {
            Err(CallError::Remote { code, message }) => {
                assert_eq!(code, "ACTION_NOT_FOUND");
                assert_eq!(message, "nope");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_as_decodes_payload() {
        #[derive(serde::Deserialize)]
        struct Sum {
            total: i64,
        }

        let mut h = start(ConnectionConfig::default());
        let conn = Arc::clone(&h.conn);
        let call = tokio::spawn(async move { conn.call_as::<Sum>("add", json!([1, 2])).await });

        let req = h.peer.next_envelope().await.unwrap();
        h.peer
            .send_envelope(&Envelope::response_to(&req, json!({"total": 3})))
            .await;
        assert_eq!(call.await.unwrap().unwrap().total, 3);
    }

    #[tokio::test]
    async fn peer_close_frame_closes_connection() {
        let mut h = start(ConnectionConfig::default());
        h.peer.send_close().await;

        assert_eq!(
            h.peer.next_frame().await,
            Some(Frame::Close(Some(NORMAL_CLOSURE)))
        );
        h.task.await.unwrap();
        assert_eq!(h.host.removed().len(), 1);
    }

    #[tokio::test]
    async fn hang_up_closes_connection() {
        let mut h = start(ConnectionConfig::default());
        h.peer.hang_up();
        h.conn.closed().await;
        assert_eq!(h.conn.state(), ConnectionState::Closed);
        assert_eq!(h.host.removed().len(), 1);
    }

    #[tokio::test]
    async fn failed_close_frame_forces_close() {
        let h = start(ConnectionConfig::default());
        h.peer.fail_writes(true);
        h.conn.close();
        h.task.await.unwrap();
        assert!(h.peer.was_force_closed());
    }

    #[tokio::test]
    async fn empty_and_null_frames_are_ignored() {
        let mut h = start(ConnectionConfig::default());
        h.peer.send_text("").await;
        h.peer.send_text("null").await;

        let resp = round_trip(&mut h.peer, "still-here").await;
        assert_eq!(resp.id, "still-here");
        assert!(h.conn.is_open());
    }

    #[test]
    fn state_from_raw() {
        assert_eq!(ConnectionState::from_u8(0), ConnectionState::Open);
        assert_eq!(ConnectionState::from_u8(1), ConnectionState::Closing);
        assert_eq!(ConnectionState::from_u8(2), ConnectionState::Closed);
    }
}
