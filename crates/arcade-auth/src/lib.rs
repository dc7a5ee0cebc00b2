//! Arcade account login and stored credentials.

pub mod callback;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod login;
pub mod pkce;

pub use callback::{CallbackResult, OAuthCallbackServer, LOCAL_CALLBACK_PORT};
pub use config::{AuthConfig, Config, ContextConfig, UserConfig};
pub use coordinator::{CliConfig, CoordinatorClient, TokenResponse, WhoAmI};
pub use error::AuthError;
pub use login::{
    credentials_from_login, perform_oauth_login, save_credentials, LoginOptions, LoginResult,
};
