//! Command dispatch
//!
//! The table is assembled once with [`RouterBuilder`] and is read-only
//! afterwards. Every frame that reaches [`Router::dispatch`] yields exactly
//! one response carrying the request's `seq`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::protocol::{Request, Response, StatusCode};
use crate::throttle::{CommandLimiter, CommandThrottle};

/// Handler outcome; the message falls back to the code's default text
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: StatusCode,
    pub message: Option<String>,
    pub data: Value,
}

impl Reply {
    #[must_use]
    pub const fn ok(data: Value) -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
            data,
        }
    }

    #[must_use]
    pub const fn error(code: StatusCode) -> Self {
        Self {
            code,
            message: None,
            data: Value::Null,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, conn: &Arc<Connection>, seq: &str, data: &Value) -> Reply;
}

#[derive(Default)]
pub struct RouterBuilder {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    throttle: CommandThrottle,
}

impl RouterBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `cmd`, replacing any earlier registration
    #[must_use]
    pub fn route(mut self, cmd: impl Into<String>, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.insert(cmd.into(), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn throttle(mut self, throttle: CommandThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub fn build(self) -> Router {
        Router {
            handlers: self.handlers,
            throttle: self.throttle,
        }
    }
}

pub struct Router {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    throttle: CommandThrottle,
}

impl Router {
    #[must_use]
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Registered command names, sorted
    #[must_use]
    pub fn commands(&self) -> Vec<&str> {
        let mut commands: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        commands.sort_unstable();
        commands
    }

    /// Limiter to attach to a new connection
    #[must_use]
    pub fn new_limiter(&self) -> Option<CommandLimiter> {
        self.throttle.new_limiter()
    }

    pub async fn dispatch(&self, conn: &Arc<Connection>, raw: &[u8]) -> Response {
        let request = match Request::decode(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection_id = %conn.id(), error = %e.reason, "Malformed request");
                return Response::new(
                    e.seq,
                    e.cmd,
                    StatusCode::ParameterIllegal,
                    None,
                    Value::Null,
                );
            }
        };
        conn.heartbeat(Utc::now());

        let Some(handler) = self.handlers.get(&request.cmd) else {
            debug!(connection_id = %conn.id(), cmd = %request.cmd, "Route not found");
            return Response::new(
                request.seq,
                request.cmd,
                StatusCode::RoutingNotExist,
                None,
                Value::Null,
            );
        };

        if let Err(throttled) = self.throttle.check(conn.command_limiter(), &request.cmd) {
            warn!(
                connection_id = %conn.id(),
                cmd = %request.cmd,
                retry_after = ?throttled.retry_after,
                "Command throttled"
            );
            return Response::new(
                request.seq,
                request.cmd,
                StatusCode::OperationFailure,
                Some("Too many requests"),
                Value::Null,
            );
        }

        let outcome = AssertUnwindSafe(handler.handle(conn, &request.seq, &request.data))
            .catch_unwind()
            .await;
        let reply = outcome.unwrap_or_else(|panic| {
            let reason = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                connection_id = %conn.id(),
                cmd = %request.cmd,
                panic = %reason,
                "Command handler panicked"
            );
            Reply::error(StatusCode::ServerError)
        });

        debug!(
            connection_id = %conn.id(),
            cmd = %request.cmd,
            code = reply.code.as_u32(),
            "Command handled"
        );
        Response::new(
            request.seq,
            request.cmd,
            reply.code,
            reply.message.as_deref(),
            reply.data,
        )
    }
}
