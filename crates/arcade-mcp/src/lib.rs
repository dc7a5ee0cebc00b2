//! Serve a catalog of Arcade tools over MCP and the worker HTTP API.

pub mod authorization;
pub mod catalog;
pub mod error;
pub mod executor;
pub mod guard;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod session;
pub mod settings;
pub mod toolkits;
pub mod transport;
pub mod worker;

pub use authorization::{ArcadeAuthorizer, Authorizer};
pub use catalog::{ToolCatalog, ToolSpec, Toolkit};
pub use error::{ServerError, ToolError};
pub use executor::{ToolContext, ToolExecutor};
pub use guard::{ConnectionGuard, ConnectionLease};
pub use middleware::{LoggingMiddleware, MessageContext, MessageProcessor, Middleware};
pub use server::McpServer;
pub use session::{ServerSession, SessionState};
pub use settings::ServerSettings;
pub use transport::{HttpStreamableTransport, SseTransport};
pub use worker::{Worker, WorkerComponent};
