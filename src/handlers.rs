//! Built-in `system.*` handlers.

use std::sync::Arc;

use async_trait::async_trait;
use coms_connection::{Connection, Handler, HandlerRegistry};
use coms_core::{Envelope, HandlerError};
use serde_json::{Value, json};

/// Register every built-in handler.
pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register("system.echo", EchoHandler);
    registry.register("system.ping", PingHandler);
}

/// Answers with the request payload unchanged.
pub struct EchoHandler;

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

/// Liveness probe at the application level.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(
        &self,
        connection: &Arc<Connection>,
        _request: &Envelope,
    ) -> Result<Value, HandlerError> {
        Ok(json!({
            "pong": true,
            "connectionId": connection.id(),
            "pendingCalls": connection.pending_calls(),
        }))
    }
}
