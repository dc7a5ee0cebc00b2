//! Error types
//!
//! [`ToolError`] is what a tool reports back to the caller; it never takes
//! the server down. [`ServerError`] covers the protocol plumbing around it.

use std::fmt;

use arcade_protocol::JsonRpcError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where the error originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorOrigin {
    Toolkit,
    Tool,
    Upstream,
    Unknown,
}

/// When the error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorPhase {
    Load,
    Definition,
    Runtime,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    LoadFailed,
    BadDefinition,
    BadInputSchema,
    BadOutputSchema,
    BadInputValue,
    BadOutputValue,
    RetryTool,
    ContextRequired,
    Fatal,
    BadRequest,
    AuthError,
    NotFound,
    ValidationError,
    RateLimit,
    ServerError,
    Unknown,
}

impl ErrorOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorOrigin::Toolkit => "TOOLKIT",
            ErrorOrigin::Tool => "TOOL",
            ErrorOrigin::Upstream => "UPSTREAM",
            ErrorOrigin::Unknown => "UNKNOWN",
        }
    }
}

impl ErrorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPhase::Load => "LOAD",
            ErrorPhase::Definition => "DEFINITION",
            ErrorPhase::Runtime => "RUNTIME",
            ErrorPhase::Unknown => "UNKNOWN",
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::LoadFailed => "LOAD_FAILED",
            ErrorCode::BadDefinition => "BAD_DEFINITION",
            ErrorCode::BadInputSchema => "BAD_INPUT_SCHEMA",
            ErrorCode::BadOutputSchema => "BAD_OUTPUT_SCHEMA",
            ErrorCode::BadInputValue => "BAD_INPUT_VALUE",
            ErrorCode::BadOutputValue => "BAD_OUTPUT_VALUE",
            ErrorCode::RetryTool => "RETRY_TOOL",
            ErrorCode::ContextRequired => "CONTEXT_REQUIRED",
            ErrorCode::Fatal => "FATAL",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

/// The concrete failure a tool reports. Determines the default origin,
/// phase and code, and the type name shown in message prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    ToolkitLoad,
    Definition,
    InputSchema,
    OutputSchema,
    Input,
    Output,
    Execution,
    Retryable,
    ContextRequired,
    Fatal,
    Upstream,
    UpstreamRateLimit,
}

impl ToolErrorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ToolErrorKind::ToolkitLoad => "ToolkitLoadError",
            ToolErrorKind::Definition => "ToolDefinitionError",
            ToolErrorKind::InputSchema => "ToolInputSchemaError",
            ToolErrorKind::OutputSchema => "ToolOutputSchemaError",
            ToolErrorKind::Input => "ToolInputError",
            ToolErrorKind::Output => "ToolOutputError",
            ToolErrorKind::Execution => "ToolExecutionError",
            ToolErrorKind::Retryable => "RetryableToolError",
            ToolErrorKind::ContextRequired => "ContextRequiredToolError",
            ToolErrorKind::Fatal => "FatalToolError",
            ToolErrorKind::Upstream => "UpstreamError",
            ToolErrorKind::UpstreamRateLimit => "UpstreamRateLimitError",
        }
    }

    fn defaults(&self) -> (ErrorOrigin, ErrorPhase, ErrorCode) {
        use ErrorOrigin as O;
        use ErrorPhase as P;
        match self {
            ToolErrorKind::ToolkitLoad => (O::Toolkit, P::Load, ErrorCode::LoadFailed),
            ToolErrorKind::Definition => (O::Tool, P::Definition, ErrorCode::BadDefinition),
            ToolErrorKind::InputSchema => (O::Tool, P::Definition, ErrorCode::BadInputSchema),
            ToolErrorKind::OutputSchema => (O::Tool, P::Definition, ErrorCode::BadOutputSchema),
            ToolErrorKind::Input => (O::Tool, P::Runtime, ErrorCode::BadInputValue),
            ToolErrorKind::Output => (O::Tool, P::Runtime, ErrorCode::BadOutputValue),
            ToolErrorKind::Execution | ToolErrorKind::Fatal => {
                (O::Tool, P::Runtime, ErrorCode::Fatal)
            }
            ToolErrorKind::Retryable => (O::Tool, P::Runtime, ErrorCode::RetryTool),
            ToolErrorKind::ContextRequired => (O::Tool, P::Runtime, ErrorCode::ContextRequired),
            ToolErrorKind::Upstream => (O::Upstream, P::Runtime, ErrorCode::Fatal),
            ToolErrorKind::UpstreamRateLimit => (O::Upstream, P::Runtime, ErrorCode::RateLimit),
        }
    }
}

/// Failure reported by (or on behalf of) a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub origin: ErrorOrigin,
    pub phase: ErrorPhase,
    pub code: ErrorCode,
    pub message: String,
    pub developer_message: Option<String>,
    pub can_retry: bool,
    pub status_code: Option<u16>,
    pub retry_after_ms: Option<u64>,
    pub additional_prompt_content: Option<String>,
    pub extra: Option<Map<String, Value>>,
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ToolError {}

/// Milliseconds used when an upstream rate limit gives no usable hint
const DEFAULT_RETRY_AFTER_MS: u64 = 1_000;

impl ToolError {
    fn of_kind(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        let (origin, phase, code) = kind.defaults();
        Self {
            kind,
            origin,
            phase,
            code,
            message: message.into(),
            developer_message: None,
            can_retry: matches!(kind, ToolErrorKind::Retryable | ToolErrorKind::UpstreamRateLimit),
            status_code: None,
            retry_after_ms: None,
            additional_prompt_content: None,
            extra: None,
        }
    }

    pub fn toolkit_load(message: impl Into<String>) -> Self {
        Self::of_kind(ToolErrorKind::ToolkitLoad, message)
    }

    pub fn definition(message: impl Into<String>) -> Self {
        Self::of_kind(ToolErrorKind::Definition, message)
    }

    pub fn input_schema(message: impl Into<String>) -> Self {
        Self::of_kind(ToolErrorKind::InputSchema, message)
    }

    pub fn output_schema(message: impl Into<String>) -> Self {
        Self::of_kind(ToolErrorKind::OutputSchema, message)
    }

    /// Bad argument value (HTTP 400 semantics)
    pub fn input(message: impl Into<String>) -> Self {
        let mut err = Self::of_kind(ToolErrorKind::Input, message);
        err.status_code = Some(400);
        err
    }

    /// Unserializable return value (HTTP 500 semantics)
    pub fn output(message: impl Into<String>) -> Self {
        let mut err = Self::of_kind(ToolErrorKind::Output, message);
        err.status_code = Some(500);
        err
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::of_kind(ToolErrorKind::Execution, message)
    }

    pub fn retryable(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        let mut err = Self::of_kind(ToolErrorKind::Retryable, message);
        err.retry_after_ms = retry_after_ms;
        err
    }

    pub fn context_required(message: impl Into<String>) -> Self {
        Self::of_kind(ToolErrorKind::ContextRequired, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        let mut err = Self::of_kind(ToolErrorKind::Fatal, message);
        err.status_code = Some(500);
        err
    }

    /// Upstream failure; code and retryability follow the status.
    pub fn upstream(message: impl Into<String>, status: u16) -> Self {
        let mut err = Self::of_kind(ToolErrorKind::Upstream, message);
        err.status_code = Some(status);
        err.can_retry = status >= 500 || status == 429;
        err.code = match status {
            401 | 403 => ErrorCode::AuthError,
            404 => ErrorCode::NotFound,
            422 => ErrorCode::ValidationError,
            429 => ErrorCode::RateLimit,
            s if s >= 500 => ErrorCode::ServerError,
            s if (400..500).contains(&s) => ErrorCode::BadRequest,
            _ => ErrorCode::Fatal,
        };
        err
    }

    pub fn upstream_rate_limit(message: impl Into<String>, retry_after_ms: u64) -> Self {
        let mut err = Self::of_kind(ToolErrorKind::UpstreamRateLimit, message);
        err.status_code = Some(429);
        err.retry_after_ms = Some(retry_after_ms);
        err
    }

    /// Map a failed upstream HTTP response. 429 always becomes a rate-limit
    /// error; 503 carrying `Retry-After` becomes retryable with that delay.
    pub fn from_http_status(status: u16, retry_after: Option<&str>, body: &str) -> Self {
        let message = match status {
            404 => format!("Not found error: {}", body),
            429 => "Too many requests, the service is busy. Please try again later.".to_string(),
            s if s < 500 => format!("Bad request error: {}", body),
            _ => format!("Server error: {}", body),
        };
        let retry_ms = retry_after.and_then(|h| parse_retry_after(h, Utc::now()));

        let err = match status {
            429 => Self::upstream_rate_limit(message, retry_ms.unwrap_or(DEFAULT_RETRY_AFTER_MS)),
            503 if retry_ms.is_some() => {
                let mut err = Self::upstream(message, status);
                err.retry_after_ms = retry_ms;
                err
            }
            _ => Self::upstream(message, status),
        };
        err.with_developer_message(format!(
            "Upstream request failed with status code {}: {}",
            status, body
        ))
    }

    pub fn with_developer_message(mut self, message: impl Into<String>) -> Self {
        self.developer_message = Some(message.into());
        self
    }

    pub fn with_prompt_content(mut self, content: impl Into<String>) -> Self {
        self.additional_prompt_content = Some(content.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }

    /// `[ORIGIN_PHASE_CODE] TypeName in execution of tool 'name': `
    pub fn message_prefix(&self, name: &str) -> String {
        let situation = match self.phase {
            ErrorPhase::Load => format!("when loading toolkit '{}'", name),
            ErrorPhase::Definition => format!("in definition of tool '{}'", name),
            ErrorPhase::Runtime | ErrorPhase::Unknown => format!("in execution of tool '{}'", name),
        };
        format!(
            "[{}_{}_{}] {} {}: ",
            self.origin.as_str(),
            self.phase.as_str(),
            self.code.as_str(),
            self.kind.type_name(),
            situation
        )
    }

    /// Prefix the message (and developer message) with the tool or toolkit name.
    pub fn with_context(mut self, name: &str) -> Self {
        let prefix = self.message_prefix(name);
        self.message = format!("{}{}", prefix, self.message);
        if let Some(dev) = self.developer_message.take() {
            self.developer_message = Some(format!("{}{}", prefix, dev));
        }
        self
    }

    pub fn to_payload(&self) -> ToolCallError {
        ToolCallError {
            message: self.message.clone(),
            developer_message: self.developer_message.clone(),
            origin: self.origin,
            phase: self.phase,
            code: self.code,
            can_retry: self.can_retry,
            status_code: self.status_code,
            retry_after_ms: self.retry_after_ms,
            additional_prompt_content: self.additional_prompt_content.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// Wire form of a [`ToolError`] in worker responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_message: Option<String>,
    pub origin: ErrorOrigin,
    pub phase: ErrorPhase,
    pub code: ErrorCode,
    pub can_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_prompt_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
}

/// `Retry-After` is either delay-seconds or an HTTP-date.
pub fn parse_retry_after(header: &str, now: DateTime<Utc>) -> Option<u64> {
    let header = header.trim();
    if let Ok(secs) = header.parse::<u64>() {
        return Some(secs.saturating_mul(1_000));
    }
    let at = DateTime::parse_from_rfc2822(header).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.num_milliseconds().max(0) as u64)
}

/// Protocol-level failures around sessions and transports
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Lifespan error: {0}")]
    Lifespan(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Protocol(#[from] JsonRpcError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        match self {
            ServerError::Protocol(e) => e.clone(),
            ServerError::NotFound(msg) => JsonRpcError::invalid_params(msg.clone()),
            ServerError::Session(msg) => JsonRpcError::invalid_request(msg.clone()),
            ServerError::Json(e) => JsonRpcError::parse_error(e.to_string()),
            other => JsonRpcError::internal_error(other.to_string()),
        }
    }
}
