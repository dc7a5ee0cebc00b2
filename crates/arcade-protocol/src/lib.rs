#[cfg(any(test, feature = "client"))]
pub mod client;
pub mod jsonrpc;
pub mod mcp;

#[cfg(any(test, feature = "client"))]
pub use client::LineClient;
pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION,
};
pub use mcp::{methods, Content, McpTool, ToolCallResult, MCP_PROTOCOL_VERSION};
