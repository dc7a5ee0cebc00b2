//! Streamable HTTP transport
//!
//! Every JSON-RPC message is a `POST /mcp`. The session is carried in the
//! `Mcp-Session-Id` header, assigned by the response to `initialize`.
//! Sessions idle longer than `session_timeout` are reaped in the background.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use arcade_protocol::{methods, JsonRpcMessage, JsonRpcResponse};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::guard::{ConnectionGuard, ConnectionLease};
use crate::server::McpServer;
use crate::session::ServerSession;
use crate::worker::WorkerComponent;

use super::ApiError;

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const MCP_ROUTE: &str = "/mcp";

struct HttpSession {
    session: Arc<ServerSession>,
    // Serializes requests within one session
    turn: tokio::sync::Mutex<()>,
    last_active: Mutex<Instant>,
    _lease: ConnectionLease,
}

impl HttpSession {
    fn touch(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    fn is_idle_for(&self, timeout: Duration) -> bool {
        // A request in flight keeps the session alive
        if self.turn.try_lock().is_err() {
            return false;
        }
        self.last_active
            .lock()
            .map(|last| last.elapsed() >= timeout)
            .unwrap_or(false)
    }
}

struct HttpState {
    server: McpServer,
    guard: Arc<ConnectionGuard>,
    sessions: RwLock<HashMap<String, Arc<HttpSession>>>,
    reaper_started: AtomicBool,
}

impl HttpState {
    fn lookup(&self, id: &str) -> Option<Arc<HttpSession>> {
        self.sessions.read().ok()?.get(id).cloned()
    }

    fn remove(&self, id: &str) -> bool {
        let removed = match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(id),
            Err(_) => None,
        };
        self.server.close_session(id);
        removed.is_some()
    }

    fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Close every session idle for at least `timeout`.
    fn reap_expired(&self, timeout: Duration) -> usize {
        let expired: Vec<String> = match self.sessions.read() {
            Ok(sessions) => sessions
                .iter()
                .filter(|(_, entry)| entry.is_idle_for(timeout))
                .map(|(id, _)| id.clone())
                .collect(),
            Err(_) => return 0,
        };
        for id in &expired {
            info!(session = %id, "HTTP session expired");
            self.remove(id);
        }
        expired.len()
    }

    /// Drop every session, releasing their connection slots.
    fn clear(&self) -> usize {
        let drained: Vec<String> = match self.sessions.write() {
            Ok(mut sessions) => sessions.drain().map(|(id, _)| id).collect(),
            Err(_) => Vec::new(),
        };
        for id in &drained {
            self.server.close_session(id);
        }
        drained.len()
    }
}

/// Periodically reap idle sessions until the transport is dropped or the
/// server shuts down.
fn spawn_reaper(state: &Arc<HttpState>) {
    if state.reaper_started.swap(true, Ordering::SeqCst) {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No runtime; idle HTTP sessions will not be reaped");
        state.reaper_started.store(false, Ordering::SeqCst);
        return;
    };

    let weak = Arc::downgrade(state);
    let timeout = state.server.settings().session_timeout;
    let every = state.server.settings().cleanup_interval;
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(state) = weak.upgrade() else {
                break;
            };
            if state.server.is_shutting_down() {
                let closed = state.clear();
                debug!(closed, "HTTP session reaper stopped");
                break;
            }
            let reaped = state.reap_expired(timeout);
            if reaped > 0 {
                debug!(reaped, remaining = state.session_count(), "Reaped idle HTTP sessions");
            }
        }
    });
}

/// HTTP-streamable binding of an [`McpServer`]
#[derive(Clone)]
pub struct HttpStreamableTransport {
    state: Arc<HttpState>,
}

impl HttpStreamableTransport {
    pub fn new(server: McpServer) -> Self {
        let max = server.settings().max_connections;
        Self::with_guard(server, Arc::new(ConnectionGuard::new("http", max)))
    }

    pub fn with_guard(server: McpServer, guard: Arc<ConnectionGuard>) -> Self {
        Self {
            state: Arc::new(HttpState {
                server,
                guard,
                sessions: RwLock::new(HashMap::new()),
                reaper_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.state.guard.active_count()
    }

    pub fn router(&self) -> Router {
        spawn_reaper(&self.state);
        Router::new()
            .route(MCP_ROUTE, post(post_message).delete(delete_session))
            .with_state(self.state.clone())
    }
}

impl WorkerComponent for HttpStreamableTransport {
    fn name(&self) -> &str {
        "mcp_http"
    }

    fn routes(&self) -> Router {
        self.router()
    }

    fn status(&self) -> Value {
        json!({
            "status": "mcp_active",
            "endpoint": MCP_ROUTE,
            "server_name": self.state.server.info().name,
            "active_connections": self.state.guard.active_count(),
            "max_connections": self.state.guard.max(),
        })
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn post_message(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let message = match JsonRpcMessage::parse(&body) {
        Ok(message) => message,
        Err(e) => {
            let body = Json(JsonRpcResponse::error(None, e));
            return (StatusCode::BAD_REQUEST, body).into_response();
        }
    };

    let entry = match session_header(&headers) {
        Some(id) => match state.lookup(&id) {
            Some(entry) => entry,
            None => return ApiError::not_found("Could not find session").into_response(),
        },
        None if message.method() == Some(methods::INITIALIZE) => match open(&state) {
            Ok(entry) => entry,
            Err(e) => return e.into_response(),
        },
        None => return ApiError::bad_request("Missing Mcp-Session-Id header").into_response(),
    };

    let response = {
        let _turn = entry.turn.lock().await;
        entry.touch();
        let response = state.server.handle_message(&entry.session, message).await;
        entry.touch();
        response
    };

    let mut response = match response {
        Some(message) => Json(message).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(entry.session.id()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn open(state: &HttpState) -> Result<Arc<HttpSession>, ApiError> {
    let lease = state.guard.acquire_lease().ok_or_else(|| {
        warn!(max = state.guard.max(), "Rejecting HTTP session, at capacity");
        ApiError::unavailable("Too many connections")
    })?;
    let session = state
        .server
        .open_session("http")
        .map_err(|e| ApiError::unavailable(e.to_string()))?;

    info!(session = %session.id(), connection = %lease.id(), "HTTP session created");
    let entry = Arc::new(HttpSession {
        session,
        turn: tokio::sync::Mutex::new(()),
        last_active: Mutex::new(Instant::now()),
        _lease: lease,
    });
    state
        .sessions
        .write()
        .map_err(|_| ApiError::internal("Session table poisoned"))?
        .insert(entry.session.id().to_string(), entry.clone());
    Ok(entry)
}

async fn delete_session(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let id = session_header(&headers)
        .ok_or_else(|| ApiError::bad_request("Missing Mcp-Session-Id header"))?;
    if !state.remove(&id) {
        return Err(ApiError::not_found("Could not find session"));
    }
    debug!(session = %id, "HTTP session deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ServerSettings;
    use crate::toolkits::default_catalog;

    fn transport(max_connections: usize) -> HttpStreamableTransport {
        transport_with(ServerSettings {
            max_connections,
            ..Default::default()
        })
    }

    fn transport_with(settings: ServerSettings) -> HttpStreamableTransport {
        let server = McpServer::builder(Arc::new(default_catalog().unwrap()))
            .settings(settings)
            .build();
        HttpStreamableTransport::new(server)
    }

    fn ping(id: u64) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": "ping"})
    }

    async fn serve(transport: &HttpStreamableTransport) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        let app = transport.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    fn initialize() -> Value {
        json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "2025-03-26", "capabilities": {}, "clientInfo": {"name": "t", "version": "1"}}
        })
    }

    async fn start_session(http: &reqwest::Client, url: &str) -> String {
        let resp = http.post(url).json(&initialize()).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        resp.headers()[SESSION_HEADER].to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let transport = transport(10);
        let url = serve(&transport).await;
        let http = reqwest::Client::new();

        let session = start_session(&http, &url).await;
        assert_eq!(transport.active_connections(), 1);

        let notified = http
            .post(&url)
            .header(SESSION_HEADER, &session)
            .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .send()
            .await
            .unwrap();
        assert_eq!(notified.status(), 202);

        let resp = http
            .post(&url)
            .header(SESSION_HEADER, &session)
            .json(&json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {"name": "Math_Subtract", "arguments": {"a": "10", "b": "4"}}
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"]["content"][0]["text"], "6");

        let deleted = http.delete(&url).header(SESSION_HEADER, &session).send().await.unwrap();
        assert_eq!(deleted.status(), 204);
        assert_eq!(transport.active_connections(), 0);
        assert_eq!(transport.state.server.active_sessions(), 0);

        let gone = http
            .post(&url)
            .header(SESSION_HEADER, &session)
            .json(&json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}))
            .send()
            .await
            .unwrap();
        assert_eq!(gone.status(), 404);
    }

    #[tokio::test]
    async fn test_missing_session_header() {
        let transport = transport(10);
        let url = serve(&transport).await;
        let http = reqwest::Client::new();

        let resp = http
            .post(&url)
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = http.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), 400);

        let resp = http.delete(&url).header(SESSION_HEADER, "nope").send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_unparsable_body() {
        let transport = transport(10);
        let url = serve(&transport).await;
        let resp = reqwest::Client::new().post(&url).body("{oops").send().await.unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], arcade_protocol::JsonRpcError::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let transport = transport(1);
        let url = serve(&transport).await;
        let http = reqwest::Client::new();

        let first = start_session(&http, &url).await;
        let rejected = http.post(&url).json(&initialize()).send().await.unwrap();
        assert_eq!(rejected.status(), 503);

        http.delete(&url).header(SESSION_HEADER, &first).send().await.unwrap();
        start_session(&http, &url).await;
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let transport = transport_with(ServerSettings {
            session_timeout: Duration::from_millis(400),
            cleanup_interval: Duration::from_millis(50),
            ..Default::default()
        });
        let url = serve(&transport).await;
        let http = reqwest::Client::new();

        let session = start_session(&http, &url).await;
        for id in 2..4 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let resp = http
                .post(&url)
                .header(SESSION_HEADER, &session)
                .json(&ping(id))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200, "activity keeps the session alive");
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while transport.active_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(transport.active_connections(), 0);
        assert_eq!(transport.state.server.active_sessions(), 0);

        let resp = http
            .post(&url)
            .header(SESSION_HEADER, &session)
            .json(&ping(9))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_busy_session_is_not_reaped() {
        let transport = transport(10);
        let entry = open(&transport.state).unwrap();

        let turn = entry.turn.lock().await;
        assert_eq!(transport.state.reap_expired(Duration::ZERO), 0);
        drop(turn);

        assert_eq!(transport.state.reap_expired(Duration::ZERO), 1);
        let session = entry.session.clone();
        drop(entry);
        assert!(session.is_closed());
        assert_eq!(transport.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_sessions() {
        let transport = transport_with(ServerSettings {
            cleanup_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let url = serve(&transport).await;
        start_session(&reqwest::Client::new(), &url).await;
        assert_eq!(transport.active_connections(), 1);

        transport.state.server.shutdown();
        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.active_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(transport.active_connections(), 0);
    }
}
