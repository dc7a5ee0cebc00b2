//! Server settings from the environment

use std::time::Duration;

use crate::authorization::DEFAULT_ENGINE_URL;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8002;
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_SSE_PATH: &str = "/sse";
pub const DEFAULT_MESSAGE_PATH: &str = "messages/";
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub sse_path: String,
    pub message_path: String,
    /// Idle HTTP sessions older than this are reaped
    pub session_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Per-session bound on queued SSE messages, both directions
    pub max_queue_size: usize,
    pub worker_secret: Option<String>,
    pub disable_auth: bool,
    pub environment: String,
    pub api_key: Option<String>,
    pub engine_url: String,
    /// Used as the authorization user id when set
    pub user_email: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "arcade-mcp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sse_path: DEFAULT_SSE_PATH.to_string(),
            message_path: DEFAULT_MESSAGE_PATH.to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            worker_secret: None,
            disable_auth: false,
            environment: "local".to_string(),
            api_key: None,
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            user_email: None,
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. Empty values count
    /// as unset; unparsable numbers keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Self {
            name: get("ARCADE_MCP_NAME").unwrap_or(defaults.name),
            version: defaults.version,
            instructions: get("ARCADE_MCP_INSTRUCTIONS"),
            host: get("ARCADE_MCP_HOST").unwrap_or(defaults.host),
            port: get("ARCADE_MCP_PORT").and_then(|v| v.parse().ok()).unwrap_or(defaults.port),
            max_connections: get("ARCADE_MCP_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            sse_path: get("ARCADE_MCP_SSE_PATH")
                .map(|p| normalize_sse_path(&p))
                .unwrap_or(defaults.sse_path),
            message_path: get("ARCADE_MCP_MESSAGE_PATH")
                .map(|p| normalize_message_path(&p))
                .unwrap_or(defaults.message_path),
            session_timeout: get("MCP_TRANSPORT_SESSION_TIMEOUT_SECONDS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_timeout),
            cleanup_interval: get("MCP_TRANSPORT_CLEANUP_INTERVAL_SECONDS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
            max_queue_size: get("MCP_TRANSPORT_MAX_QUEUE_SIZE")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|size| *size > 0)
                .unwrap_or(defaults.max_queue_size),
            worker_secret: get("ARCADE_WORKER_SECRET"),
            disable_auth: get("ARCADE_MCP_DISABLE_AUTH").map(|v| is_truthy(&v)).unwrap_or(false),
            environment: get("ARCADE_ENVIRONMENT").unwrap_or(defaults.environment),
            api_key: get("ARCADE_API_KEY"),
            engine_url: get("ARCADE_ENGINE_URL").unwrap_or(defaults.engine_url),
            user_email: None,
        }
    }

    /// Path of the SSE stream, e.g. `/mcp/sse`
    pub fn sse_route(&self) -> String {
        format!("/mcp{}", self.sse_path)
    }

    /// Path clients post messages to, e.g. `/mcp/messages/`
    pub fn message_route(&self) -> String {
        format!("/mcp/{}", self.message_path)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn normalize_sse_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

fn normalize_message_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}
