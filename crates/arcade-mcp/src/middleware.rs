//! Message middleware
//!
//! Every message passes through the chain twice: once inbound as a
//! [`Direction::Request`], once outbound as a [`Direction::Response`].
//! Request ids are only unique within a session, so middleware that pairs
//! requests with responses keys on [`MessageContext::session_id`] too.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arcade_protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use tracing::{debug, error, info, trace, warn, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Where a message is in its trip through the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext<'a> {
    pub session_id: &'a str,
    pub direction: Direction,
}

impl<'a> MessageContext<'a> {
    pub fn request(session_id: &'a str) -> Self {
        Self {
            session_id,
            direction: Direction::Request,
        }
    }

    pub fn response(session_id: &'a str) -> Self {
        Self {
            session_id,
            direction: Direction::Response,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    #[error("Middleware '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn process(
        &self,
        message: JsonRpcMessage,
        ctx: MessageContext<'_>,
    ) -> Result<JsonRpcMessage, MiddlewareError>;
}

/// Ordered middleware chain
#[derive(Clone, Default)]
pub struct MessageProcessor {
    chain: Vec<Arc<dyn Middleware>>,
}

impl MessageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the chain. The same instance is only added once.
    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        if self.chain.iter().any(|m| Arc::ptr_eq(m, &middleware)) {
            return;
        }
        self.chain.push(middleware);
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Run the chain in insertion order. A failing middleware is skipped and
    /// the message it was handed continues down the chain.
    pub fn process(&self, mut message: JsonRpcMessage, ctx: MessageContext<'_>) -> JsonRpcMessage {
        for middleware in &self.chain {
            match middleware.process(message.clone(), ctx) {
                Ok(next) => message = next,
                Err(e) => {
                    error!(
                        middleware = middleware.name(),
                        error = %e,
                        "Middleware failed; continuing"
                    );
                }
            }
        }
        message
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub log_request_body: bool,
    pub log_response_body: bool,
    pub log_errors: bool,
    /// Completions faster than this are not logged
    pub min_duration_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_request_body: false,
            log_response_body: false,
            log_errors: true,
            min_duration_ms: 0,
        }
    }
}

struct Pending {
    method: String,
    started: Instant,
}

/// Logs request starts, completions with timing, and errors.
pub struct LoggingMiddleware {
    config: LoggingConfig,
    // (session id, request id) -> in-flight request
    pending: Mutex<HashMap<(String, String), Pending>>,
}

impl LoggingMiddleware {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn emit(&self, line: &str) {
        match self.config.level {
            Level::ERROR => error!("{}", line),
            Level::WARN => warn!("{}", line),
            Level::INFO => info!("{}", line),
            Level::DEBUG => debug!("{}", line),
            Level::TRACE => trace!("{}", line),
        }
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn start(&self, session_id: &str, request: &JsonRpcRequest) {
        let Some(id) = &request.id else {
            return;
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                (session_id.to_string(), id.to_string()),
                Pending {
                    method: request.method.clone(),
                    started: Instant::now(),
                },
            );
        }
    }

    /// Method and elapsed milliseconds of the request this response answers
    fn finish(&self, session_id: &str, request_id: &str) -> (String, u64) {
        let pending = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.remove(&(session_id.to_string(), request_id.to_string())));
        match pending {
            Some(p) => (p.method, p.started.elapsed().as_millis() as u64),
            None => ("unknown".to_string(), 0),
        }
    }

    fn request_line(&self, request: &JsonRpcRequest) -> String {
        let id = request
            .id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "notification".into());
        let mut line = format!("[MCP>] {} ({})", request.method, id);
        if self.config.log_request_body {
            if let Some(params) = &request.params {
                line.push_str(&format!(" params={}", params));
            }
        }
        line
    }

    fn response_line(
        &self,
        method: &str,
        elapsed_ms: u64,
        response: &JsonRpcResponse,
    ) -> Option<String> {
        let id = response.id.as_ref()?.to_string();
        if let Some(err) = &response.error {
            if !self.config.log_errors {
                return None;
            }
            return Some(format!("[MCP!] {} error: {} ({})", method, err.message, id));
        }
        if elapsed_ms < self.config.min_duration_ms {
            return None;
        }
        let mut line = format!("[MCP<] {} completed in {}ms ({})", method, elapsed_ms, id);
        if self.config.log_response_body {
            if let Some(result) = &response.result {
                line.push_str(&format!(" result={}", result));
            }
        }
        Some(line)
    }

    /// Update request timing for `message` and return its log line, if any.
    fn record(&self, message: &JsonRpcMessage, ctx: MessageContext<'_>) -> Option<String> {
        match (ctx.direction, message) {
            (Direction::Request, JsonRpcMessage::Request(req)) => {
                self.start(ctx.session_id, req);
                Some(self.request_line(req))
            }
            (Direction::Response, JsonRpcMessage::Response(resp)) => {
                let id = resp.id.as_ref()?.to_string();
                let (method, elapsed_ms) = self.finish(ctx.session_id, &id);
                self.response_line(&method, elapsed_ms, resp)
            }
            _ => None,
        }
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new(LoggingConfig::default())
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn process(
        &self,
        message: JsonRpcMessage,
        ctx: MessageContext<'_>,
    ) -> Result<JsonRpcMessage, MiddlewareError> {
        if let Some(line) = self.record(&message, ctx) {
            self.emit(&line);
        }
        Ok(message)
    }
}
