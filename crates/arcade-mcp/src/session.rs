//! Per-connection session state

use std::sync::RwLock;

use arcade_protocol::mcp::{ClientInfo, LoggingLevel};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `initialize`
    Created,
    /// `initialize` answered
    Initialized,
    /// Client sent `notifications/initialized`
    Ready,
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    client_info: Option<ClientInfo>,
    protocol_version: Option<String>,
    log_level: LoggingLevel,
}

#[derive(Debug)]
pub struct ServerSession {
    id: String,
    transport: String,
    created_at: DateTime<Utc>,
    inner: RwLock<SessionInner>,
}

impl ServerSession {
    pub fn new(id: impl Into<String>, transport: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: transport.into(),
            created_at: Utc::now(),
            inner: RwLock::new(SessionInner {
                state: SessionState::Created,
                client_info: None,
                protocol_version: None,
                log_level: LoggingLevel::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.read(|s| s.state)
    }

    pub fn client_info(&self) -> Option<ClientInfo> {
        self.read(|s| s.client_info.clone())
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.read(|s| s.protocol_version.clone())
    }

    pub fn log_level(&self) -> LoggingLevel {
        self.read(|s| s.log_level)
    }

    pub fn set_log_level(&self, level: LoggingLevel) {
        self.write(|s| s.log_level = level);
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state(), SessionState::Initialized | SessionState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// `ServerError::Session` once the session has been closed.
    pub fn ensure_open(&self) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::Session(format!("Session {} is closed", self.id)));
        }
        Ok(())
    }

    /// Record the handshake. A repeated `initialize` refreshes the client
    /// details without moving a ready session backwards.
    pub fn mark_initialized(
        &self,
        client_info: Option<ClientInfo>,
        protocol_version: String,
    ) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.write(|s| {
            if s.state == SessionState::Created {
                s.state = SessionState::Initialized;
            }
            s.client_info = client_info;
            s.protocol_version = Some(protocol_version);
        });
        debug!(session = %self.id, "Session initialized");
        Ok(())
    }

    pub fn mark_ready(&self) {
        self.write(|s| {
            if s.state == SessionState::Initialized {
                s.state = SessionState::Ready;
            }
        });
    }

    /// Returns true only for the call that actually closed the session.
    pub fn close(&self) -> bool {
        let closed = self.write(|s| {
            let was_open = s.state != SessionState::Closed;
            s.state = SessionState::Closed;
            was_open
        });
        if closed {
            debug!(session = %self.id, transport = %self.transport, "Session closed");
        }
        closed
    }

    fn read<T>(&self, f: impl FnOnce(&SessionInner) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write<T>(&self, f: impl FnOnce(&mut SessionInner) -> T) -> T {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}
