//! Tool execution
//!
//! Arguments are checked against the tool's declared parameters before the
//! handler runs. Every failure comes back as a [`ToolError`] payload in the
//! output; nothing here returns early with a protocol error.

use std::sync::Arc;
use std::time::Instant;

use arcade_protocol::Content;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::catalog::{InputParameter, MaterializedTool};
use crate::error::{ToolCallError, ToolError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAuthorizationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub user_info: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSecretItem {
    pub key: String,
    pub value: String,
}

/// Everything a tool may need besides its arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<ToolAuthorizationContext>,
    #[serde(default)]
    pub secrets: Vec<ToolSecretItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ToolContext {
    pub fn set_secret(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.secrets.iter_mut().find(|s| s.key.eq_ignore_ascii_case(&key)) {
            Some(existing) => existing.value = value,
            None => self.secrets.push(ToolSecretItem { key, value }),
        }
    }

    /// Secret lookup is case-insensitive on the key.
    pub fn get_secret(&self, key: &str) -> Result<&str, ToolError> {
        self.secrets
            .iter()
            .find(|s| s.key.eq_ignore_ascii_case(key))
            .map(|s| s.value.as_str())
            .ok_or_else(|| {
                ToolError::context_required(format!("Secret '{}' not found in context.", key))
            })
    }

    pub fn auth_token(&self) -> Result<&str, ToolError> {
        self.authorization
            .as_ref()
            .and_then(|a| a.token.as_deref())
            .ok_or_else(|| ToolError::context_required("Authorization token not found in context."))
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        context: ToolContext,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(&ToolContext, &Map<String, Value>) -> Result<Value, ToolError> + Send + Sync,
{
    async fn call(
        &self,
        context: ToolContext,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolError> {
        (self.0)(&context, &arguments)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn from_fn<F>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(&ToolContext, &Map<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Result of a tool run: exactly one of `value` or `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolCallError>,
}

impl ToolCallOutput {
    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    pub fn error(error: &ToolError) -> Self {
        Self {
            value: None,
            error: Some(error.to_payload()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolExecutor;

impl ToolExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(
        &self,
        tool: &MaterializedTool,
        context: ToolContext,
        arguments: Map<String, Value>,
    ) -> ToolCallOutput {
        let name = tool.definition.fully_qualified_name.clone();
        let started = Instant::now();

        if let Err(err) = validate_arguments(&tool.definition.input.parameters, &arguments) {
            let err = err.with_context(&name);
            warn!(tool = %name, error = %err, "Rejected tool input");
            return ToolCallOutput::error(&err);
        }

        let result = tool.handler.call(context, arguments).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                debug!(tool = %name, elapsed_ms, "Tool completed");
                ToolCallOutput::value(value)
            }
            Err(err) => {
                let err = err.with_context(&name);
                warn!(tool = %name, elapsed_ms, error = %err, "Tool failed");
                ToolCallOutput::error(&err)
            }
        }
    }
}

fn validate_arguments(
    params: &[InputParameter],
    arguments: &Map<String, Value>,
) -> Result<(), ToolError> {
    for key in arguments.keys() {
        if !params.iter().any(|p| &p.name == key) {
            return Err(ToolError::input(format!("Unexpected argument '{}'", key)));
        }
    }

    for param in params {
        let value = match arguments.get(&param.name) {
            Some(Value::Null) | None if param.required => {
                return Err(ToolError::input(format!("Missing required argument '{}'", param.name)));
            }
            Some(Value::Null) | None => continue,
            Some(v) => v,
        };

        let schema = &param.value_schema;
        if !schema.val_type.accepts(value) {
            return Err(ToolError::input(format!(
                "Argument '{}' must be of type {}",
                param.name,
                schema.val_type.json_schema_type()
            )));
        }

        if let (Some(inner), Some(items)) = (schema.inner_val_type, value.as_array()) {
            if let Some(pos) = items.iter().position(|item| !inner.accepts(item)) {
                return Err(ToolError::input(format!(
                    "Argument '{}' item {} must be of type {}",
                    param.name,
                    pos,
                    inner.json_schema_type()
                )));
            }
        }

        if let (Some(allowed), Some(s)) = (&schema.enum_values, value.as_str()) {
            if !allowed.iter().any(|a| a == s) {
                return Err(ToolError::input(format!(
                    "Argument '{}' must be one of: {}",
                    param.name,
                    allowed.join(", ")
                )));
            }
        }
    }
    Ok(())
}

/// Turn a tool's return value into MCP content blocks.
pub fn convert_to_mcp_content(value: &Value) -> Vec<Content> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => vec![Content::text(s.clone())],
        Value::Array(items) => items.iter().flat_map(convert_to_mcp_content).collect(),
        Value::Object(map) => {
            let is_block = matches!(
                map.get("type").and_then(Value::as_str),
                Some("text" | "image" | "resource")
            );
            if is_block {
                if let Ok(content) = serde_json::from_value::<Content>(value.clone()) {
                    return vec![content];
                }
            }
            vec![Content::text(value.to_string())]
        }
        other => vec![Content::text(other.to_string())],
    }
}
