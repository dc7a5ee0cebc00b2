//! MCP server
//!
//! Transport-agnostic: transports open a [`ServerSession`], feed it messages
//! in arrival order through [`McpServer::handle_message`] and write back
//! whatever comes out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use arcade_protocol::mcp::{
    InitializeParams, InitializeResult, PromptsCapabilities, ResourcesCapabilities,
    ServerCapabilities, ServerInfo, SetLevelParams, ToolCallParams, ToolsCapabilities,
    ToolsListResult, SUPPORTED_PROTOCOL_VERSIONS,
};
use arcade_protocol::{
    methods, Content, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, ToolCallResult,
    MCP_PROTOCOL_VERSION,
};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::authorization::Authorizer;
use crate::catalog::{MaterializedTool, ToolCatalog};
use crate::error::ServerError;
use crate::executor::{convert_to_mcp_content, ToolAuthorizationContext, ToolContext, ToolExecutor};
use crate::middleware::{MessageContext, MessageProcessor};
use crate::session::ServerSession;
use crate::settings::ServerSettings;

struct ServerInner {
    info: ServerInfo,
    instructions: Option<String>,
    catalog: Arc<ToolCatalog>,
    executor: ToolExecutor,
    processor: MessageProcessor,
    authorizer: Option<Arc<dyn Authorizer>>,
    settings: ServerSettings,
    sessions: RwLock<HashMap<String, Arc<ServerSession>>>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    stdio_active: AtomicBool,
}

/// MCP server instance (cheaply cloneable)
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

pub struct McpServerBuilder {
    catalog: Arc<ToolCatalog>,
    settings: ServerSettings,
    processor: MessageProcessor,
    authorizer: Option<Arc<dyn Authorizer>>,
    executor: ToolExecutor,
}

impl McpServerBuilder {
    pub fn settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn processor(mut self, processor: MessageProcessor) -> Self {
        self.processor = processor;
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn executor(mut self, executor: ToolExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn build(self) -> McpServer {
        let info = ServerInfo {
            name: self.settings.name.clone(),
            version: self.settings.version.clone(),
        };
        McpServer {
            inner: Arc::new(ServerInner {
                info,
                instructions: self.settings.instructions.clone(),
                catalog: self.catalog,
                executor: self.executor,
                processor: self.processor,
                authorizer: self.authorizer,
                settings: self.settings,
                sessions: RwLock::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
                shutdown_tx: watch::channel(false).0,
                stdio_active: AtomicBool::new(false),
            }),
        }
    }
}

impl McpServer {
    pub fn builder(catalog: Arc<ToolCatalog>) -> McpServerBuilder {
        McpServerBuilder {
            catalog,
            settings: ServerSettings::default(),
            processor: MessageProcessor::default(),
            authorizer: None,
            executor: ToolExecutor::default(),
        }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.inner.info
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.inner.catalog
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.inner.executor
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Flips to `true` once [`McpServer::shutdown`] runs.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn session(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.inner.sessions.read().ok()?.get(id).cloned()
    }

    /// Register a new session. Refused once shutdown has begun.
    pub fn open_session(&self, transport: &str) -> Result<Arc<ServerSession>, ServerError> {
        if self.is_shutting_down() {
            return Err(ServerError::Lifespan("Server is shutting down".to_string()));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let session = Arc::new(ServerSession::new(id.clone(), transport));
        self.inner
            .sessions
            .write()
            .map_err(|_| ServerError::Session("Session table poisoned".to_string()))?
            .insert(id.clone(), session.clone());
        info!(session = %id, transport, "Session opened");
        Ok(session)
    }

    /// Close and forget a session; false if it was unknown.
    pub fn close_session(&self, id: &str) -> bool {
        let removed = match self.inner.sessions.write() {
            Ok(mut sessions) => sessions.remove(id),
            Err(_) => None,
        };
        match removed {
            Some(session) => {
                session.close();
                info!(session = %id, "Session closed");
                true
            }
            None => false,
        }
    }

    /// Close every session and refuse new ones.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Arc<ServerSession>> = match self.inner.sessions.write() {
            Ok(mut sessions) => sessions.drain().map(|(_, s)| s).collect(),
            Err(_) => Vec::new(),
        };
        for session in &drained {
            session.close();
        }
        self.inner.shutdown_tx.send_replace(true);
        info!(closed = drained.len(), "MCP server shut down");
    }

    /// Only one stdio session may run at a time.
    pub(crate) fn claim_stdio(&self) -> bool {
        self.inner
            .stdio_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_stdio(&self) {
        self.inner.stdio_active.store(false, Ordering::SeqCst);
    }

    /// Handle one line of newline-delimited JSON-RPC. Blank lines and
    /// notifications produce nothing.
    pub async fn handle_line(&self, session: &ServerSession, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let response = match JsonRpcMessage::parse(trimmed) {
            Ok(message) => self.handle_message(session, message).await?,
            Err(e) => {
                warn!(session = %session.id(), error = %e, "Unparsable message");
                JsonRpcResponse::error(None, e).into()
            }
        };

        match serde_json::to_string(&response) {
            Ok(json) => Some(json),
            Err(e) => {
                error!(error = %e, "Failed to serialize response");
                None
            }
        }
    }

    /// Run a message through the middleware chain and dispatch it.
    pub async fn handle_message(
        &self,
        session: &ServerSession,
        message: JsonRpcMessage,
    ) -> Option<JsonRpcMessage> {
        let message = self.inner.processor.process(message, MessageContext::request(session.id()));

        let request = match message {
            JsonRpcMessage::Request(req) => req,
            JsonRpcMessage::Response(resp) => {
                debug!(session = %session.id(), id = ?resp.id, "Ignoring client response");
                return None;
            }
        };

        let response = match session.ensure_open() {
            Ok(()) => self.dispatch(session, request).await?,
            Err(e) => JsonRpcResponse::error(Some(request.id?), e.to_jsonrpc()),
        };
        Some(
            self.inner
                .processor
                .process(response.into(), MessageContext::response(session.id())),
        )
    }

    async fn dispatch(
        &self,
        session: &ServerSession,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        if let Err(e) = request.validate() {
            return request.id.map(|id| JsonRpcResponse::error(Some(id), e));
        }

        let Some(id) = request.id.clone() else {
            self.handle_notification(session, &request);
            return None;
        };

        let method = request.method.as_str();
        if !session.is_initialized() && method != methods::INITIALIZE && method != methods::PING {
            warn!(session = %session.id(), method, "Request before initialization");
            let error = JsonRpcError::invalid_request(
                "Received request before initialization was complete",
            );
            return Some(JsonRpcResponse::error(Some(id), error));
        }

        let result = match method {
            methods::INITIALIZE => self.handle_initialize(session, request.params),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => self.handle_tools_list(),
            methods::TOOLS_CALL => self.handle_tools_call(session, request.params).await,
            methods::LOGGING_SET_LEVEL => handle_set_level(session, request.params),
            // No resources or prompts are served; the lists are always empty
            methods::RESOURCES_LIST => Ok(json!({ "resources": [] })),
            methods::RESOURCES_TEMPLATES_LIST => Ok(json!({ "resourceTemplates": [] })),
            methods::PROMPTS_LIST => Ok(json!({ "prompts": [] })),
            methods::RESOURCES_READ => Err(not_found_param(&request.params, "uri", "Resource")),
            methods::PROMPTS_GET => Err(not_found_param(&request.params, "name", "Prompt")),
            methods::SHUTDOWN => {
                info!(session = %session.id(), "Shutdown requested");
                Ok(json!({}))
            }
            _ => {
                warn!(method, "Unknown method");
                Err(JsonRpcError::method_not_found(method))
            }
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(Some(id), value),
            Err(e) => JsonRpcResponse::error(Some(id), e),
        })
    }

    fn handle_notification(&self, session: &ServerSession, request: &JsonRpcRequest) {
        match request.method.as_str() {
            methods::INITIALIZED => {
                session.mark_ready();
                debug!(session = %session.id(), "Client initialized");
            }
            methods::CANCELLED => {
                debug!(session = %session.id(), params = ?request.params, "Request cancelled")
            }
            other => debug!(session = %session.id(), method = other, "Ignoring notification"),
        }
    }

    fn handle_initialize(
        &self,
        session: &ServerSession,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = parse_params(params)?;

        let version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
            params.protocol_version.clone()
        } else {
            MCP_PROTOCOL_VERSION.to_string()
        };

        info!(
            session = %session.id(),
            client_name = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol_version = %version,
            "Client initializing"
        );
        session
            .mark_initialized(Some(params.client_info), version.clone())
            .map_err(|e| e.to_jsonrpc())?;

        let result = InitializeResult {
            protocol_version: version,
            capabilities: ServerCapabilities {
                tools: ToolsCapabilities { list_changed: false },
                logging: Some(json!({})),
                resources: Some(ResourcesCapabilities::default()),
                prompts: Some(PromptsCapabilities::default()),
            },
            server_info: self.inner.info.clone(),
            instructions: self.inner.instructions.clone(),
        };
        to_result(&result)
    }

    fn handle_tools_list(&self) -> Result<Value, JsonRpcError> {
        to_result(&ToolsListResult {
            tools: self.inner.catalog.mcp_tools(),
            next_cursor: None,
        })
    }

    async fn handle_tools_call(
        &self,
        session: &ServerSession,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcError> {
        let call: ToolCallParams = parse_params(params)?;

        let result = self
            .call_tool(session.id(), &call.name, call.arguments.unwrap_or_default())
            .await;
        to_result(&result)
    }

    /// Run a tool on behalf of a connection. Failures come back as an
    /// `isError` result, never as a protocol error.
    pub async fn call_tool(
        &self,
        connection_id: &str,
        name: &str,
        arguments: Map<String, Value>,
    ) -> ToolCallResult {
        let Some(tool) = self.inner.catalog.get_tool_by_name(name) else {
            warn!(tool = name, "Unknown tool");
            return ToolCallResult::error(format!(
                "Error calling tool {}: Tool '{}' not found",
                name, name
            ));
        };

        let user_id = self
            .inner
            .settings
            .user_email
            .clone()
            .unwrap_or_else(|| connection_id.to_string());
        let mut context = ToolContext {
            user_id: Some(user_id.clone()),
            ..Default::default()
        };
        for key in tool.definition.secret_keys() {
            if let Ok(value) = std::env::var(key) {
                context.set_secret(key, value);
            }
        }

        if let Err(result) = self.authorize(tool, &user_id, name, &mut context).await {
            return result;
        }

        debug!(tool = name, "Calling tool");
        let output = self.inner.executor.run(tool, context, arguments).await;

        match (output.value, output.error) {
            (_, Some(err)) => {
                error!(tool = name, error = %err.message, "Error calling tool");
                if let Some(dev) = &err.developer_message {
                    debug!(tool = name, developer_message = %dev, "Developer details");
                }
                ToolCallResult::error(format!("Error calling tool {}: {}", name, err.message))
            }
            (Some(value), None) => ToolCallResult::success(convert_to_mcp_content(&value)),
            (None, None) => ToolCallResult::success(Vec::new()),
        }
    }

    /// Fill in the authorization context, or return the result to send
    /// instead of running the tool.
    async fn authorize(
        &self,
        tool: &MaterializedTool,
        user_id: &str,
        name: &str,
        context: &mut ToolContext,
    ) -> Result<(), ToolCallResult> {
        let Some(requirement) = &tool.definition.requirements.authorization else {
            return Ok(());
        };
        let Some(authorizer) = &self.inner.authorizer else {
            return Err(ToolCallResult::error(format!(
                "Error calling tool {}: Tool requires authorization but no Arcade API key is configured",
                name
            )));
        };

        let response = authorizer.authorize(requirement, user_id).await.map_err(|e| {
            error!(tool = name, error = %e, "Error authorizing tool");
            ToolCallResult::error(format!("Error calling tool {}: {}", name, e.message))
        })?;

        if !response.is_completed() {
            info!(tool = name, status = ?response.status, "Tool requires authorization");
            return Err(ToolCallResult::success(vec![Content::text(
                response.url.unwrap_or_default(),
            )]));
        }

        let auth = response.context.unwrap_or_default();
        context.authorization = Some(ToolAuthorizationContext {
            token: auth.token,
            user_info: auth.user_info.unwrap_or_default(),
        });
        Ok(())
    }
}

fn handle_set_level(session: &ServerSession, params: Option<Value>) -> Result<Value, JsonRpcError> {
    let params: SetLevelParams = parse_params(params)?;
    session.set_log_level(params.level);
    Ok(json!({}))
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))
}

fn not_found_param(params: &Option<Value>, key: &str, kind: &str) -> JsonRpcError {
    match params.as_ref().and_then(|p| p.get(key)).and_then(Value::as_str) {
        Some(value) => JsonRpcError::invalid_params(format!("{} '{}' not found", kind, value)),
        None => JsonRpcError::invalid_params(format!("Missing '{}'", key)),
    }
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::{AuthorizationContext, AuthorizationResponse, AuthorizationStatus};
    use crate::catalog::{AuthRequirement, ToolSpec, Toolkit};
    use crate::error::ToolError;
    use crate::executor::from_fn;
    use crate::toolkits::default_catalog;
    use arcade_protocol::mcp::LoggingLevel;
    use async_trait::async_trait;

    const INIT: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"test","version":"1.0"}}}"#;

    fn server() -> McpServer {
        McpServer::builder(Arc::new(default_catalog().unwrap())).build()
    }

    async fn send(server: &McpServer, session: &ServerSession, line: &str) -> Value {
        let out = server.handle_line(session, line).await.unwrap();
        serde_json::from_str(&out).unwrap()
    }

    async fn ready(server: &McpServer) -> Arc<ServerSession> {
        let session = server.open_session("test").unwrap();
        send(server, &session, INIT).await;
        server
            .handle_line(&session, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        session
    }

    #[tokio::test]
    async fn test_process_initialize() {
        let server = server();
        let session = server.open_session("test").unwrap();
        let response = send(&server, &session, INIT).await;

        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
        assert!(response["result"]["capabilities"]["tools"].is_object());
        assert_eq!(response["result"]["serverInfo"]["name"], "arcade-mcp");
        assert!(session.is_initialized());
    }

    #[tokio::test]
    async fn test_unknown_protocol_version_gets_ours() {
        let server = server();
        let session = server.open_session("test").unwrap();
        let line = INIT.replace("2024-11-05", "1999-01-01");
        let response = send(&server, &session, &line).await;
        assert_eq!(response["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_request_before_initialize_is_rejected() {
        let server = server();
        let session = server.open_session("test").unwrap();

        let response = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], JsonRpcError::INVALID_REQUEST);

        let ping = send(&server, &session, r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#).await;
        assert_eq!(ping["result"], json!({}));
    }

    #[tokio::test]
    async fn test_requests_served_before_initialized_notification() {
        let server = server();
        let session = server.open_session("test").unwrap();
        send(&server, &session, INIT).await;

        let response = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        )
        .await;
        assert!(response["error"].is_null());
        assert!(response["result"]["tools"].is_array());
    }

    #[tokio::test]
    async fn test_process_tools_list() {
        let server = server();
        let session = ready(&server).await;
        let response = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        )
        .await;

        let tools = response["result"]["tools"].as_array().unwrap();
        assert!(!tools.is_empty());
        assert!(tools.iter().any(|t| t["name"] == "Math_Add"));
        assert_eq!(tools[0]["inputSchema"]["type"], "object");
    }

    #[tokio::test]
    async fn test_process_tools_call() {
        let server = server();
        let session = ready(&server).await;
        let response = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"Math_Add","arguments":{"a":"2","b":"2"}}}"#,
        )
        .await;

        assert_eq!(response["result"]["isError"], false);
        assert_eq!(response["result"]["content"][0]["type"], "text");
        assert_eq!(response["result"]["content"][0]["text"], "4");
    }

    #[tokio::test]
    async fn test_tool_error_is_error_content() {
        let server = server();
        let session = ready(&server).await;
        let response = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"Math.Divide","arguments":{"a":"1","b":"0"}}}"#,
        )
        .await;

        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("Error calling tool Math.Divide: "));
        assert!(text.contains("Cannot divide by zero"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_content() {
        let server = server();
        let session = ready(&server).await;
        let response = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"Nope_Nothing"}}"#,
        )
        .await;
        assert_eq!(response["result"]["isError"], true);
        assert!(response["error"].is_null());
    }

    #[tokio::test]
    async fn test_tools_call_missing_params() {
        let server = server();
        let session = ready(&server).await;
        let response = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":6,"method":"tools/call"}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], JsonRpcError::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_process_unknown_method() {
        let server = server();
        let session = ready(&server).await;
        let response = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":4,"method":"unknown/method"}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], JsonRpcError::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_process_invalid_json() {
        let server = server();
        let session = server.open_session("test").unwrap();
        let response = send(&server, &session, "not valid json").await;
        assert_eq!(response["error"]["code"], JsonRpcError::PARSE_ERROR);
        assert!(response["id"].is_null());
    }

    #[tokio::test]
    async fn test_wrong_jsonrpc_version() {
        let server = server();
        let session = server.open_session("test").unwrap();
        let response = send(&server, &session, r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).await;
        assert_eq!(response["error"]["code"], JsonRpcError::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_notifications_and_blank_lines_produce_nothing() {
        let server = server();
        let session = server.open_session("test").unwrap();
        assert!(server.handle_line(&session, "   ").await.is_none());
        assert!(server
            .handle_line(&session, r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{}}"#)
            .await
            .is_none());
        assert!(server
            .handle_line(&session, r#"{"jsonrpc":"2.0","id":9,"result":{}}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_set_level() {
        let server = server();
        let session = ready(&server).await;
        let response = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":7,"method":"logging/setLevel","params":{"level":"debug"}}"#,
        )
        .await;
        assert_eq!(response["result"], json!({}));
        assert_eq!(session.log_level(), LoggingLevel::Debug);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_requests() {
        let server = server();
        let session = ready(&server).await;
        assert!(server.close_session(session.id()));
        assert!(!server.close_session(session.id()));

        let response = send(&server, &session, r#"{"jsonrpc":"2.0","id":8,"method":"ping"}"#).await;
        assert_eq!(response["error"]["code"], JsonRpcError::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_resources_and_prompts_are_empty() {
        let server = server();
        let session = ready(&server).await;

        let init = send(&server, &server.open_session("test").unwrap(), INIT).await;
        assert!(init["result"]["capabilities"]["resources"].is_object());
        assert!(init["result"]["capabilities"]["prompts"].is_object());

        let resources = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#,
        )
        .await;
        assert_eq!(resources["result"], json!({"resources": []}));
        let templates = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":3,"method":"resources/templates/list"}"#,
        )
        .await;
        assert_eq!(templates["result"], json!({"resourceTemplates": []}));
        let prompts = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":4,"method":"prompts/list"}"#,
        )
        .await;
        assert_eq!(prompts["result"], json!({"prompts": []}));

        let read = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":5,"method":"resources/read","params":{"uri":"file:///x"}}"#,
        )
        .await;
        assert_eq!(read["error"]["code"], JsonRpcError::INVALID_PARAMS);
        assert_eq!(read["error"]["message"], "Resource 'file:///x' not found");
        let get = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":6,"method":"prompts/get","params":{"name":"greet"}}"#,
        )
        .await;
        assert_eq!(get["error"]["message"], "Prompt 'greet' not found");
    }

    #[derive(Default)]
    struct ResponseCounter(std::sync::atomic::AtomicUsize);

    impl crate::middleware::Middleware for ResponseCounter {
        fn name(&self) -> &str {
            "counter"
        }

        fn process(
            &self,
            message: JsonRpcMessage,
            ctx: MessageContext<'_>,
        ) -> Result<JsonRpcMessage, crate::middleware::MiddlewareError> {
            if ctx.direction == crate::middleware::Direction::Response {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            Ok(message)
        }
    }

    #[tokio::test]
    async fn test_closed_session_errors_pass_through_middleware() {
        let counter = Arc::new(ResponseCounter::default());
        let server = McpServer::builder(Arc::new(default_catalog().unwrap()))
            .processor(MessageProcessor::new().with(counter.clone()))
            .build();
        let session = ready(&server).await;
        let before = counter.0.load(Ordering::SeqCst);

        server.close_session(session.id());
        let response = send(&server, &session, r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#).await;
        assert_eq!(response["error"]["code"], JsonRpcError::INVALID_REQUEST);
        assert_eq!(counter.0.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_refuses_new_ones() {
        let server = server();
        let a = server.open_session("test").unwrap();
        server.open_session("test").unwrap();
        assert_eq!(server.active_sessions(), 2);
        let mut signal = server.shutdown_signal();
        assert!(!*signal.borrow());

        server.shutdown();
        assert!(signal.has_changed().unwrap());
        assert!(*signal.borrow_and_update());
        assert_eq!(server.active_sessions(), 0);
        assert!(a.is_closed());
        assert!(matches!(server.open_session("test"), Err(ServerError::Lifespan(_))));
    }

    struct FakeAuthorizer {
        complete: bool,
    }

    #[async_trait]
    impl Authorizer for FakeAuthorizer {
        async fn authorize(
            &self,
            _: &AuthRequirement,
            user_id: &str,
        ) -> Result<AuthorizationResponse, ToolError> {
            Ok(AuthorizationResponse {
                id: Some("ar".into()),
                status: if self.complete {
                    AuthorizationStatus::Completed
                } else {
                    AuthorizationStatus::Pending
                },
                url: Some(format!("https://auth.example.com/{}", user_id)),
                context: Some(AuthorizationContext {
                    token: Some("tok".into()),
                    user_info: None,
                }),
            })
        }
    }

    fn auth_server(complete: bool) -> McpServer {
        let whoami = from_fn(|ctx, _| Ok(json!(ctx.auth_token()?)));
        let requirement = AuthRequirement {
            provider_id: Some("google".into()),
            provider_type: "oauth2".into(),
            oauth2: None,
        };
        let token = ToolSpec::new("Token", "Returns the token", whoami).authorization(requirement);
        let toolkit = Toolkit::new("Auth", "1.0.0").tool(token);
        let catalog = ToolCatalog::builder().add_toolkit(toolkit).unwrap().build();
        McpServer::builder(Arc::new(catalog))
            .authorizer(Arc::new(FakeAuthorizer { complete }))
            .build()
    }

    #[tokio::test]
    async fn test_pending_authorization_returns_url() {
        let server = auth_server(false);
        let result = server.call_tool("conn_1", "Auth.Token", Map::new()).await;
        assert!(!result.is_error);
        assert_eq!(result.content[0].as_text(), Some("https://auth.example.com/conn_1"));
    }

    #[tokio::test]
    async fn test_completed_authorization_passes_token() {
        let server = auth_server(true);
        let result = server.call_tool("conn_1", "Auth_Token", Map::new()).await;
        assert_eq!(result.content[0].as_text(), Some("tok"));
    }

    #[tokio::test]
    async fn test_authorization_without_authorizer() {
        let server = auth_server(true);
        let bare = McpServer::builder(server.catalog().clone()).build();
        let result = bare.call_tool("conn_1", "Auth.Token", Map::new()).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_user_email_is_authorization_user() {
        let server = auth_server(false);
        let settings = ServerSettings {
            user_email: Some("dev@example.com".into()),
            ..Default::default()
        };
        let server = McpServer::builder(server.catalog().clone())
            .settings(settings)
            .authorizer(Arc::new(FakeAuthorizer { complete: false }))
            .build();
        let result = server.call_tool("conn_1", "Auth.Token", Map::new()).await;
        assert_eq!(result.content[0].as_text(), Some("https://auth.example.com/dev@example.com"));
    }

    #[tokio::test]
    async fn test_secrets_come_from_environment() {
        let read = from_fn(|ctx, _| Ok(json!(ctx.get_secret("ARCADE_MCP_TEST_SECRET_X")?)));
        let spec = ToolSpec::new("Read", "Reads a secret", read).secret("ARCADE_MCP_TEST_SECRET_X");
        let toolkit = Toolkit::new("Env", "1.0.0").tool(spec);
        let catalog = ToolCatalog::builder().add_toolkit(toolkit).unwrap().build();
        let server = McpServer::builder(Arc::new(catalog)).build();

        let missing = server.call_tool("c", "Env.Read", Map::new()).await;
        assert!(missing.is_error);

        std::env::set_var("ARCADE_MCP_TEST_SECRET_X", "shh");
        let found = server.call_tool("c", "Env.Read", Map::new()).await;
        assert_eq!(found.content[0].as_text(), Some("shh"));
    }
}
