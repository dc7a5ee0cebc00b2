use std::path::PathBuf;

/// Errors raised while logging in or reading stored credentials.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Configuration file not found at {0}. Please run 'arcade login' to create your configuration.")]
    ConfigNotFound(PathBuf),

    #[error("Invalid credentials file: {0}")]
    InvalidConfig(String),

    #[error("Not logged in. Please run 'arcade login' first.")]
    NotLoggedIn,

    #[error("No active organization/project. Please run 'arcade login' first.")]
    NoActiveContext,

    #[error("Could not determine home directory")]
    NoHomeDir,

    #[error("Failed to start local callback server: {0}")]
    CallbackServer(String),

    #[error("Could not connect to Arcade at {url}: {message}")]
    Coordinator { url: String, message: String },

    #[error("HTTP {status} error: {body}")]
    Http { status: u16, body: String },

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Login failed: {0}")]
    Login(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Request(#[from] reqwest::Error),
}
