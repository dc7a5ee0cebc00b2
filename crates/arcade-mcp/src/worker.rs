//! Worker HTTP surface
//!
//! `/worker/*` exposes the catalog to the Arcade Engine: list the tools,
//! invoke one, report health. MCP transports plug in as components and
//! share the same router and the same bearer check. Only `/worker/health`
//! is open.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::catalog::{ToolDefinition, ToolOutput};
use crate::error::ServerError;
use crate::executor::{ToolCallOutput, ToolContext};
use crate::server::McpServer;
use crate::transport::ApiError;

/// Something that mounts routes on the worker and reports its own health.
pub trait WorkerComponent: Send + Sync {
    fn name(&self) -> &str;
    fn routes(&self) -> Router;
    fn status(&self) -> Value;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolReference {
    pub name: String,
    pub toolkit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub execution_id: Option<String>,
    pub tool: ToolReference,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub context: ToolContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub execution_id: String,
    pub finished_at: String,
    /// Milliseconds
    pub duration: f64,
    pub success: bool,
    pub output: ToolCallOutput,
}

/// `GET /worker/tools/:name/schema`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaResponse {
    pub name: String,
    pub fully_qualified_name: String,
    pub description: String,
    /// JSON Schema of the inputs, as advertised over MCP
    pub input_schema: Value,
    pub output: ToolOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub tool_count: usize,
    pub environment: String,
    pub components: BTreeMap<String, Value>,
}

pub struct Worker {
    server: McpServer,
    secret: Option<String>,
    disable_auth: bool,
    environment: String,
    components: Vec<Arc<dyn WorkerComponent>>,
}

impl Worker {
    /// The secret is `secret`, else the configured `ARCADE_WORKER_SECRET`.
    /// Having neither is an error unless auth is disabled.
    pub fn new(server: McpServer, secret: Option<String>) -> Result<Self, ServerError> {
        let settings = server.settings();
        let disable_auth = settings.disable_auth;
        let secret = secret
            .filter(|s| !s.is_empty())
            .or_else(|| settings.worker_secret.clone());

        if secret.is_none() && !disable_auth {
            return Err(ServerError::Config(
                "No secret provided for worker. Set the ARCADE_WORKER_SECRET environment variable."
                    .to_string(),
            ));
        }
        if disable_auth {
            warn!("Worker authentication is disabled");
        }

        Ok(Self {
            environment: settings.environment.clone(),
            server,
            secret,
            disable_auth,
            components: Vec::new(),
        })
    }

    pub fn with_component(mut self, component: Arc<dyn WorkerComponent>) -> Self {
        info!(component = component.name(), "Registered worker component");
        self.components.push(component);
        self
    }

    pub fn server(&self) -> &McpServer {
        &self.server
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn disable_auth(&self) -> bool {
        self.disable_auth
    }

    pub fn catalog(&self) -> Vec<ToolDefinition> {
        self.server.catalog().definitions()
    }

    pub fn health_check(&self) -> HealthCheckResponse {
        HealthCheckResponse {
            status: "ok".to_string(),
            tool_count: self.server.catalog().len(),
            environment: self.environment.clone(),
            components: self
                .components
                .iter()
                .map(|c| (c.name().to_string(), c.status()))
                .collect(),
        }
    }

    /// Schema of one tool, looked up as `Toolkit.Name` or `Toolkit_Name`.
    pub fn tool_schema(&self, name: &str) -> Option<ToolSchemaResponse> {
        let definition = &self.server.catalog().get_tool_by_name(name)?.definition;
        Some(ToolSchemaResponse {
            name: definition.name.clone(),
            fully_qualified_name: definition.fully_qualified_name.clone(),
            description: definition.description.clone(),
            input_schema: definition.input_schema(),
            output: definition.output.clone(),
        })
    }

    /// Run one tool for the engine. `None` when the tool is unknown.
    pub async fn call_tool(&self, request: ToolCallRequest) -> Option<ToolCallResponse> {
        let tool = self.server.catalog().find(
            &request.tool.toolkit,
            &request.tool.name,
            request.tool.version.as_deref(),
        )?;
        let execution_id = request
            .execution_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let started = Instant::now();
        let output = self.server.executor().run(tool, request.context, request.inputs).await;
        let duration = started.elapsed().as_secs_f64() * 1000.0;

        info!(
            execution_id = %execution_id,
            tool = %tool.definition.fully_qualified_name,
            success = output.is_success(),
            duration_ms = duration,
            "Tool invoked"
        );

        Some(ToolCallResponse {
            execution_id,
            finished_at: Utc::now().to_rfc3339(),
            duration,
            success: output.is_success(),
            output,
        })
    }

    /// All worker routes plus every component's routes.
    pub fn router(self) -> Router {
        let worker = Arc::new(self);

        let protected = Router::new()
            .route("/worker/tools", get(list_tools))
            .route("/worker/tools/invoke", post(invoke_tool))
            .route("/worker/tools/:name/schema", get(tool_schema))
            .route_layer(middleware::from_fn_with_state(worker.clone(), require_secret));

        let mut router = protected
            .route("/worker/health", get(health))
            .with_state(worker.clone());

        for component in &worker.components {
            let routes = component
                .routes()
                .route_layer(middleware::from_fn_with_state(worker.clone(), require_secret));
            router = router.merge(routes);
        }
        router
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn serve<F>(self, addr: SocketAddr, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, environment = %self.environment, "Worker listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn require_secret(
    State(worker): State<Arc<Worker>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if worker.disable_auth {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match (provided, worker.secret.as_deref()) {
        (Some(token), Some(secret)) if secrets_match(token, secret) => Ok(next.run(request).await),
        (None, _) => {
            debug!(path = %request.uri().path(), "Missing bearer token");
            Err(ApiError::unauthorized("Missing authorization header"))
        }
        _ => {
            warn!(path = %request.uri().path(), "Invalid worker secret");
            Err(ApiError::unauthorized("Invalid authorization token"))
        }
    }
}

/// Constant-time comparison of the SHA-256 digests.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn list_tools(State(worker): State<Arc<Worker>>) -> Json<Vec<ToolDefinition>> {
    Json(worker.catalog())
}

async fn invoke_tool(
    State(worker): State<Arc<Worker>>,
    Json(request): Json<ToolCallRequest>,
) -> Result<Json<ToolCallResponse>, ApiError> {
    let name = format!("{}.{}", request.tool.toolkit, request.tool.name);
    worker
        .call_tool(request)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Tool '{}' not found", name)))
}

async fn tool_schema(
    State(worker): State<Arc<Worker>>,
    Path(name): Path<String>,
) -> Result<Json<ToolSchemaResponse>, ApiError> {
    worker
        .tool_schema(&name)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Tool '{}' not found", name)))
}

async fn health(State(worker): State<Arc<Worker>>) -> Json<HealthCheckResponse> {
    Json(worker.health_check())
}
