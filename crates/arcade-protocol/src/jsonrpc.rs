//! JSON-RPC 2.0 envelope types
//!
//! Every MCP transport (stdio lines, SSE events, streamable HTTP bodies)
//! carries exactly these messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Request ID can be either a number or string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// Request or notification (a notification has no id)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Check the envelope before dispatch.
    pub fn validate(&self) -> Result<(), JsonRpcError> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(JsonRpcError::invalid_request(
                "Invalid JSON-RPC version, expected 2.0",
            ));
        }
        if self.method.is_empty() {
            return Err(JsonRpcError::invalid_request("Method name is empty"));
        }
        Ok(())
    }
}

/// Outgoing (or, for clients, incoming) JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,

    /// Null only when the request id could not be determined
    pub id: Option<RequestId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

/// Any single message that can travel over an MCP transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Parse one message. On failure the returned error is ready to be sent
    /// back to the peer as a response with a null id.
    pub fn parse(input: &str) -> Result<Self, JsonRpcError> {
        let value: Value = serde_json::from_str(input)
            .map_err(|e| JsonRpcError::parse_error(format!("Invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, JsonRpcError> {
        let Some(object) = value.as_object() else {
            return Err(JsonRpcError::invalid_request("Message must be a JSON object"));
        };

        if object.contains_key("method") {
            serde_json::from_value(value)
                .map(JsonRpcMessage::Request)
                .map_err(|e| JsonRpcError::invalid_request(format!("Invalid request: {}", e)))
        } else if object.contains_key("result") || object.contains_key("error") {
            serde_json::from_value(value)
                .map(JsonRpcMessage::Response)
                .map_err(|e| JsonRpcError::invalid_request(format!("Invalid response: {}", e)))
        } else {
            Err(JsonRpcError::invalid_request(
                "Message is neither a request nor a response",
            ))
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(req) => req.id.as_ref(),
            JsonRpcMessage::Response(resp) => resp.id.as_ref(),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(req) => Some(req.method.as_str()),
            JsonRpcMessage::Response(_) => None,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(req) if req.is_notification())
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(req: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(req)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(resp: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(resp)
    }
}
