//! Host-side connection set.
//!
//! The [`Hub`] owns the shared handler registry and configuration, builds a
//! [`Connection`] for every accepted or dialed transport, and forgets it when
//! the connection reaches `Closed`.

use std::sync::Arc;

use coms_core::Envelope;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::errors::HubError;
use crate::registry::HandlerRegistry;
use crate::transport::{Transport, WsTransport};

/// Deregistration hook injected into every connection.
///
/// `remove` is invoked exactly once per connection, when it reaches `Closed`.
pub trait ConnectionSet: Send + Sync {
    /// Forget the connection with this id.
    fn remove(&self, connection_id: &str);
}

/// Generate a connection id: `conn_{uuid-v7}`.
pub fn connection_id() -> String {
    format!("conn_{}", Uuid::now_v7())
}

#[derive(Default)]
struct Members {
    connections: DashMap<String, Arc<Connection>>,
    emptied: Notify,
}

impl ConnectionSet for Members {
    fn remove(&self, connection_id: &str) {
        if self.connections.remove(connection_id).is_some() {
            debug!(connection_id, remaining = self.connections.len(), "connection deregistered");
        }
        if self.connections.is_empty() {
            self.emptied.notify_waiters();
        }
    }
}

/// Registry of live connections sharing one handler registry.
pub struct Hub {
    handlers: Arc<HandlerRegistry>,
    config: ConnectionConfig,
    members: Arc<Members>,
}

impl Hub {
    /// Create a hub.
    pub fn new(handlers: HandlerRegistry, config: ConnectionConfig) -> Self {
        Self {
            handlers: Arc::new(handlers),
            config,
            members: Arc::new(Members::default()),
        }
    }

    /// Shared handler registry.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Configuration given to each new connection.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Register a connection over `transport` and start its workers.
    pub fn accept<T: Transport>(&self, transport: T) -> (Arc<Connection>, JoinHandle<()>) {
        let id = connection_id();
        let host: Arc<dyn ConnectionSet> = self.members.clone();
        let (connection, driver) =
            Connection::new(id.clone(), self.config.clone(), Arc::clone(&self.handlers), host);

        // insert before the workers run so an immediate close finds the entry
        let _ = self
            .members
            .connections
            .insert(id, Arc::clone(&connection));
        let task = driver.spawn(transport);
        (connection, task)
    }

    /// Dial a WebSocket endpoint and run a connection over it.
    pub async fn connect(&self, url: &str) -> Result<(Arc<Connection>, JoinHandle<()>), HubError> {
        let (socket, _response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| HubError::Connect {
                    url: url.to_owned(),
                    message: e.to_string(),
                })?;
        let accepted = self.accept(WsTransport::new(socket));
        info!(url, connection_id = accepted.0.id(), "connected");
        Ok(accepted)
    }

    /// Connection by id.
    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.members
            .connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.members.connections.len()
    }

    /// Ids of live connections (sorted).
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .members
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Call `action` on the peer of connection `connection_id`.
    pub async fn call(
        &self,
        connection_id: &str,
        action: &str,
        payload: impl Serialize + Send,
    ) -> Result<Envelope, HubError> {
        let connection = self
            .get(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.to_owned()))?;
        Ok(connection.call(action, payload).await?)
    }

    /// Start closing every live connection.
    pub fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = self
            .members
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for connection in connections {
            connection.close();
        }
    }

    /// Wait until no connection is registered.
    pub async fn wait_empty(&self) {
        loop {
            let emptied = self.members.emptied.notified();
            if self.members.connections.is_empty() {
                return;
            }
            emptied.await;
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HandlerRegistry::new(), ConnectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use coms_core::HandlerError;
    use serde_json::{Value, json};

    use super::*;
    use crate::errors::CallError;
    use crate::registry::Handler;
    use crate::transport::mem;

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

    fn hub() -> Hub {
        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", EchoHandler);
        Hub::new(handlers, ConnectionConfig::default())
    }

    #[test]
    fn connection_ids_are_prefixed_and_unique() {
        let a = connection_id();
        let b = connection_id();
        assert!(a.starts_with("conn_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn accept_registers_connection() {
        let hub = hub();
        let (t1, _p1) = mem::pair(8);
        let (t2, _p2) = mem::pair(8);

        let (c1, _) = hub.accept(t1);
        let (c2, _) = hub.accept(t2);

        assert_eq!(hub.count(), 2);
        let mut expected = vec![c1.id().to_owned(), c2.id().to_owned()];
        expected.sort();
        assert_eq!(hub.ids(), expected);
        assert!(hub.get(c1.id()).is_some());
        assert!(hub.handlers().has_action("echo"));
    }

    #[tokio::test]
    async fn closed_connection_is_deregistered() {
        let hub = hub();
        let (transport, mut peer) = mem::pair(8);
        let (conn, task) = hub.accept(transport);

        peer.hang_up();
        task.await.unwrap();
        assert!(hub.get(conn.id()).is_none());
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn call_routes_by_id() {
        let hub = hub();
        let (transport, mut peer) = mem::pair(8);
        let (conn, _task) = hub.accept(transport);

        let id = conn.id().to_owned();
        let peer_side = tokio::spawn(async move {
            let req = peer.next_envelope().await.unwrap();
            peer.send_envelope(&Envelope::response_to(&req, json!({"pong": true})))
                .await;
            peer
        });

        let resp = hub.call(&id, "system.ping", json!(null)).await.unwrap();
        assert_eq!(resp.data, json!({"pong": true}));
        drop(peer_side.await.unwrap());
    }

    #[tokio::test]
    async fn call_unknown_connection() {
        let hub = hub();
        let err = hub.call("conn_missing", "echo", json!(1)).await.unwrap_err();
        assert!(matches!(err, HubError::UnknownConnection(id) if id == "conn_missing"));
    }

    #[tokio::test]
    async fn call_on_closed_connection_is_closed() {
        let hub = hub();
        let (transport, _peer) = mem::pair(8);
        let (conn, _task) = hub.accept(transport);
        conn.close();

        let err = hub.call(conn.id(), "echo", json!(1)).await.unwrap_err();
        assert!(matches!(
            err,
            HubError::Call(CallError::Closed) | HubError::UnknownConnection(_)
        ));
    }

    #[tokio::test]
    async fn close_all_then_wait_empty() {
        let hub = hub();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (transport, peer) = mem::pair(8);
            let _ = hub.accept(transport);
            peers.push(peer);
        }
        assert_eq!(hub.count(), 3);

        hub.close_all();
        tokio::time::timeout(Duration::from_secs(5), hub.wait_empty())
            .await
            .unwrap();
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn wait_empty_returns_immediately_when_empty() {
        let hub = hub();
        tokio::time::timeout(Duration::from_millis(100), hub.wait_empty())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        let hub = hub();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = hub.connect(&format!("ws://{addr}/ws")).await.unwrap_err();
        assert!(matches!(err, HubError::Connect { .. }));
    }
}
