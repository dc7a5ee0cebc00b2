//! SSE transport
//!
//! `GET /mcp{sse_path}` opens a stream whose first event names the endpoint
//! to post messages to. Responses come back as `message` events. Both
//! directions are queued per session up to `max_queue_size`; a full inbox
//! answers posts with 429.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arcade_protocol::JsonRpcMessage;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::guard::{ConnectionGuard, ConnectionLease};
use crate::server::McpServer;
use crate::worker::WorkerComponent;

use super::ApiError;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

struct SseState {
    server: McpServer,
    guard: Arc<ConnectionGuard>,
    inboxes: RwLock<HashMap<String, mpsc::Sender<JsonRpcMessage>>>,
    message_route: String,
}

impl SseState {
    fn inbox(&self, session_id: &str) -> Option<mpsc::Sender<JsonRpcMessage>> {
        self.inboxes.read().ok()?.get(session_id).cloned()
    }
}

/// SSE binding of an [`McpServer`]
#[derive(Clone)]
pub struct SseTransport {
    state: Arc<SseState>,
}

impl SseTransport {
    pub fn new(server: McpServer) -> Self {
        let max = server.settings().max_connections;
        Self::with_guard(server, Arc::new(ConnectionGuard::new("sse", max)))
    }

    pub fn with_guard(server: McpServer, guard: Arc<ConnectionGuard>) -> Self {
        let message_route = server.settings().message_route();
        Self {
            state: Arc::new(SseState {
                server,
                guard,
                inboxes: RwLock::new(HashMap::new()),
                message_route,
            }),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.state.guard.active_count()
    }

    pub fn router(&self) -> Router {
        let settings = self.state.server.settings();
        Router::new()
            .route(&settings.sse_route(), get(open_stream))
            .route(&settings.message_route(), post(post_message))
            .with_state(self.state.clone())
    }
}

impl WorkerComponent for SseTransport {
    fn name(&self) -> &str {
        "mcp_sse"
    }

    fn routes(&self) -> Router {
        self.router()
    }

    fn status(&self) -> Value {
        json!({
            "status": "mcp_active",
            "endpoint": self.state.server.settings().sse_route(),
            "server_name": self.state.server.info().name,
            "active_connections": self.state.guard.active_count(),
            "max_connections": self.state.guard.max(),
        })
    }
}

/// Tears the session down when the event stream is dropped.
struct SseConnection {
    state: Arc<SseState>,
    session_id: String,
    _lease: ConnectionLease,
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        if let Ok(mut inboxes) = self.state.inboxes.write() {
            inboxes.remove(&self.session_id);
        }
        self.state.server.close_session(&self.session_id);
        info!(session = %self.session_id, "SSE client disconnected");
    }
}

async fn open_stream(State(state): State<Arc<SseState>>) -> Response {
    let Some(lease) = state.guard.acquire_lease() else {
        warn!(max = state.guard.max(), "Rejecting SSE connection, at capacity");
        return ApiError::unavailable("Too many connections").into_response();
    };

    let session = match state.server.open_session("sse") {
        Ok(session) => session,
        Err(e) => return ApiError::unavailable(e.to_string()).into_response(),
    };
    let session_id = session.id().to_string();
    info!(session = %session_id, connection = %lease.id(), "SSE client connected");

    let queue_size = state.server.settings().max_queue_size.max(1);
    let (inbox_tx, mut inbox_rx) = mpsc::channel::<JsonRpcMessage>(queue_size);
    let (outbox_tx, outbox_rx) = mpsc::channel::<String>(queue_size);
    if let Ok(mut inboxes) = state.inboxes.write() {
        inboxes.insert(session_id.clone(), inbox_tx);
    }

    // One task per connection keeps messages in arrival order. Dropping the
    // outbox when it ends closes the event stream.
    let server = state.server.clone();
    let mut shutdown = server.shutdown_signal();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                message = inbox_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let Some(response) = server.handle_message(&session, message).await else {
                continue;
            };
            match serde_json::to_string(&response) {
                Ok(json) => {
                    if outbox_tx.send(json).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize response"),
            }
        }
        debug!(session = %session.id(), "SSE message loop finished");
    });

    let endpoint = format!("{}?session_id={}", state.message_route, session_id);
    let connection = SseConnection {
        state: state.clone(),
        session_id,
        _lease: lease,
    };

    let first = tokio_stream::once(Ok::<Event, Infallible>(
        Event::default().event("endpoint").data(endpoint),
    ));
    let messages = ReceiverStream::new(outbox_rx).map(move |json| {
        let _ = &connection;
        Ok(Event::default().event("message").data(json))
    });

    Sse::new(first.chain(messages))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE).text("keep-alive"))
        .into_response()
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session_id: Option<String>,
}

async fn post_message(
    State(state): State<Arc<SseState>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let session_id = query
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("session_id is required"))?;

    let inbox = state
        .inbox(&session_id)
        .ok_or_else(|| ApiError::not_found("Could not find session"))?;

    let message = JsonRpcMessage::parse(&body).map_err(|e| {
        debug!(session = %session_id, error = %e, "Could not parse message");
        ApiError::bad_request("Could not parse message")
    })?;

    inbox.try_send(message).map_err(|e| match e {
        TrySendError::Full(_) => {
            warn!(session = %session_id, "SSE inbox full, rejecting message");
            ApiError::too_many_requests("Message queue is full")
        }
        TrySendError::Closed(_) => ApiError::not_found("Could not find session"),
    })?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ServerSettings;
    use crate::toolkits::default_catalog;

    fn transport(max_connections: usize) -> SseTransport {
        transport_with(ServerSettings {
            max_connections,
            ..Default::default()
        })
    }

    fn transport_with(settings: ServerSettings) -> SseTransport {
        let server = McpServer::builder(Arc::new(default_catalog().unwrap()))
            .settings(settings)
            .build();
        SseTransport::new(server)
    }

    async fn serve(transport: &SseTransport) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = transport.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    /// Reads chunks until an event of `kind` arrives and returns its data.
    async fn next_event(
        response: &mut reqwest::Response,
        buffer: &mut String,
        kind: &str,
    ) -> String {
        let marker = format!("event: {}\n", kind);
        loop {
            if let Some(start) = buffer.find(&marker) {
                if let Some(len) = buffer[start..].find("\n\n") {
                    let block = buffer[start..start + len].to_string();
                    buffer.replace_range(..start + len + 2, "");
                    let data: Vec<&str> =
                        block.lines().filter_map(|l| l.strip_prefix("data: ")).collect();
                    return data.join("\n");
                }
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    #[tokio::test]
    async fn test_sse_round_trip() {
        let transport = transport(10);
        let base = serve(&transport).await;
        let http = reqwest::Client::new();

        let mut stream = http.get(format!("{}/mcp/sse", base)).send().await.unwrap();
        assert_eq!(stream.status(), 200);
        let mut buffer = String::new();

        let endpoint = next_event(&mut stream, &mut buffer, "endpoint").await;
        assert!(endpoint.starts_with("/mcp/messages/?session_id="));
        assert_eq!(transport.active_connections(), 1);

        let init = json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "2025-03-26", "capabilities": {}, "clientInfo": {"name": "t", "version": "1"}}
        });
        let resp = http
            .post(format!("{}{}", base, endpoint))
            .body(init.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);

        let message = next_event(&mut stream, &mut buffer, "message").await;
        let message: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(message["id"], 1);
        assert_eq!(message["result"]["protocolVersion"], "2025-03-26");

        let call = json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "Math_Add", "arguments": {"a": "40", "b": "2"}}
        });
        http.post(format!("{}{}", base, endpoint))
            .body(call.to_string())
            .send()
            .await
            .unwrap();
        let message = next_event(&mut stream, &mut buffer, "message").await;
        let message: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(message["id"], 2);
        assert_eq!(message["result"]["content"][0]["text"], "42");
    }

    #[tokio::test]
    async fn test_post_errors() {
        let transport = transport(10);
        let base = serve(&transport).await;
        let http = reqwest::Client::new();

        let missing = http.post(format!("{}/mcp/messages/", base)).body("{}").send().await.unwrap();
        assert_eq!(missing.status(), 400);

        let unknown = http
            .post(format!("{}/mcp/messages/?session_id=nope", base))
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), 404);
        let body: Value = unknown.json().await.unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let transport = transport(1);
        let base = serve(&transport).await;
        let http = reqwest::Client::new();

        let first = http.get(format!("{}/mcp/sse", base)).send().await.unwrap();
        assert_eq!(first.status(), 200);

        let second = http.get(format!("{}/mcp/sse", base)).send().await.unwrap();
        assert_eq!(second.status(), 503);
        assert_eq!(transport.active_connections(), 1);
        drop(first);
    }

    #[test]
    fn test_connection_drop_closes_session() {
        let transport = transport(2);
        let state = transport.state.clone();
        let lease = state.guard.acquire_lease().unwrap();
        let session = state.server.open_session("sse").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        state.inboxes.write().unwrap().insert(session.id().to_string(), tx);

        let connection = SseConnection {
            state: state.clone(),
            session_id: session.id().to_string(),
            _lease: lease,
        };
        assert_eq!(state.guard.active_count(), 1);
        drop(connection);

        assert_eq!(state.guard.active_count(), 0);
        assert!(session.is_closed());
        assert!(state.inbox(session.id()).is_none());
        assert_eq!(state.server.active_sessions(), 0);
    }

    #[test]
    fn test_status() {
        let transport = transport(5);
        let status = transport.status();
        assert_eq!(status["status"], "mcp_active");
        assert_eq!(status["endpoint"], "/mcp/sse");
        assert_eq!(status["max_connections"], 5);
        assert_eq!(transport.name(), "mcp_sse");
    }

    #[tokio::test]
    async fn test_full_inbox_rejects_posts() {
        let transport = transport_with(ServerSettings {
            max_queue_size: 1,
            ..Default::default()
        });
        let base = serve(&transport).await;
        // No consumer, so the second message cannot be queued
        let (tx, _rx) = mpsc::channel(transport.state.server.settings().max_queue_size);
        transport.state.inboxes.write().unwrap().insert("stalled".to_string(), tx);

        let url = format!("{}/mcp/messages/?session_id=stalled", base);
        let ping = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string();
        let http = reqwest::Client::new();

        let first = http.post(&url).body(ping.clone()).send().await.unwrap();
        assert_eq!(first.status(), 202);

        let second = http.post(&url).body(ping).send().await.unwrap();
        assert_eq!(second.status(), 429);
        let body: Value = second.json().await.unwrap();
        assert_eq!(body["error"]["code"], "too_many_requests");
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let transport = transport(10);
        let base = serve(&transport).await;

        let mut stream = reqwest::get(format!("{}/mcp/sse", base)).await.unwrap();
        let mut buffer = String::new();
        next_event(&mut stream, &mut buffer, "endpoint").await;
        assert_eq!(transport.active_connections(), 1);

        transport.state.server.shutdown();
        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            while let Ok(Some(_)) = stream.chunk().await {}
        })
        .await;
        assert!(ended.is_ok(), "stream stayed open after shutdown");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while transport.active_connections() > 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(transport.active_connections(), 0);
    }
}
