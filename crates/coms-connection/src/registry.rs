//! Action registry and dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use coms_core::errors::{ACTION_NOT_FOUND, HANDLER_TIMEOUT};
use coms_core::{Envelope, HandlerError};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::warn;

use crate::connection::Connection;

/// Trait implemented by every action handler.
///
/// A handler runs on the read worker of the connection that received the
/// request. It may enqueue through `connection` but must not await
/// [`Connection::call`] on that same connection inline: the response would be
/// delivered by the worker that is busy running the handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Produce the response payload for `request`.
    async fn handle(
        &self,
        connection: &Arc<Connection>,
        request: &Envelope,
    ) -> Result<Value, HandlerError>;
}

/// Registry mapping action names to handlers.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for an action name, replacing any previous one.
    pub fn register(&mut self, action: &str, handler: impl Handler + 'static) {
        let _ = self.handlers.insert(action.to_owned(), Arc::new(handler));
    }

    /// Handler for `action`, if registered.
    pub fn lookup(&self, action: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(action).cloned()
    }

    /// Run the handler for `request` and build its response.
    ///
    /// Never fails: a missing action, a handler error or a handler that
    /// outlives the connection's handler timeout all become error responses.
    pub async fn dispatch(&self, connection: &Arc<Connection>, request: &Envelope) -> Envelope {
        let action = request.action.clone();
        counter!("coms_requests_total", "action" => action.clone()).increment(1);

        let Some(handler) = self.lookup(&action) else {
            counter!("coms_request_errors_total", "action" => action.clone(), "error_type" => "action_not_found").increment(1);
            return Envelope::error_response(
                request,
                ACTION_NOT_FOUND,
                format!("Action '{action}' not found"),
            );
        };

        let limit = connection.config().handler_timeout;
        let start = Instant::now();
        let result = tokio::time::timeout(limit, handler.handle(connection, request)).await;

        let response = match result {
            Ok(Ok(data)) => Envelope::response_to(request, data),
            Ok(Err(err)) => {
                counter!("coms_request_errors_total", "action" => action.clone(), "error_type" => err.code().to_owned()).increment(1);
                let body = err.to_error_body();
                Envelope::error_response(request, body.code, body.message)
            }
            Err(_elapsed) => {
                counter!("coms_request_errors_total", "action" => action.clone(), "error_type" => "timeout").increment(1);
                tracing::error!(action, "handler timed out after {limit:?}");
                Envelope::error_response(
                    request,
                    HANDLER_TIMEOUT,
                    format!("Handler for '{action}' timed out"),
                )
            }
        };

        let duration = start.elapsed();
        histogram!("coms_request_duration_seconds", "action" => action.clone())
            .record(duration.as_secs_f64());

        if duration.as_secs() >= 5 {
            warn!(
                action,
                duration_secs = duration.as_secs_f64(),
                "slow handler"
            );
        }

        response
    }

    /// All registered action names (sorted).
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether an action is registered.
    pub fn has_action(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
