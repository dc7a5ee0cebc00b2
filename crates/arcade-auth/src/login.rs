//! End-to-end CLI login: PKCE authorization code flow against the Coordinator
//! with a loopback redirect.

use std::time::Duration;

use tracing::info;

use crate::callback::{OAuthCallbackServer, LOCAL_CALLBACK_PORT};
use crate::config::{AuthConfig, Config, ContextConfig, UserConfig};
use crate::coordinator::{CoordinatorClient, OrgInfo, ProjectInfo, TokenResponse, WhoAmI};
use crate::error::AuthError;
use crate::pkce::{generate_state, PkcePair};

pub const DEFAULT_OAUTH_TIMEOUT_SECONDS: u64 = 600;
pub const LOGIN_TIMEOUT_ENV: &str = "ARCADE_LOGIN_TIMEOUT_SECONDS";

const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback timeout from `ARCADE_LOGIN_TIMEOUT_SECONDS`; unset, unparsable or
/// non-positive values fall back to the default.
pub fn default_timeout_seconds() -> u64 {
    parse_timeout(std::env::var(LOGIN_TIMEOUT_ENV).ok().as_deref())
}

fn parse_timeout(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .map(|v| v as u64)
        .unwrap_or(DEFAULT_OAUTH_TIMEOUT_SECONDS)
}

#[derive(Debug, Clone)]
pub struct LoginOptions {
    /// Seconds to wait for the browser redirect; `None` or <= 0 uses the default
    pub timeout_seconds: Option<i64>,
    pub callback_port: u16,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            callback_port: LOCAL_CALLBACK_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub tokens: TokenResponse,
    pub whoami: WhoAmI,
}

impl LoginResult {
    pub fn email(&self) -> &str {
        &self.whoami.email
    }

    pub fn selected_org(&self) -> Option<&OrgInfo> {
        self.whoami.selected_org()
    }

    pub fn selected_project(&self) -> Option<&ProjectInfo> {
        self.whoami.selected_project()
    }
}

/// Run the login flow. The authorization URL is handed to `on_status`; the
/// caller decides how to get it in front of the user.
pub async fn perform_oauth_login<F>(
    coordinator_url: &str,
    options: LoginOptions,
    on_status: F,
) -> Result<LoginResult, AuthError>
where
    F: Fn(&str),
{
    let client = CoordinatorClient::new(coordinator_url)?;
    let cli_config = client.fetch_cli_config().await.map_err(|e| match e {
        AuthError::Coordinator { .. } => e,
        other => AuthError::Coordinator {
            url: coordinator_url.to_string(),
            message: other.to_string(),
        },
    })?;

    let timeout_secs = match options.timeout_seconds {
        Some(t) if t > 0 => t as u64,
        _ => default_timeout_seconds(),
    };

    let state = generate_state();
    let server = OAuthCallbackServer::start(state.clone(), options.callback_port);
    server.wait_until_ready(READY_TIMEOUT).await?;
    let redirect_uri = server.redirect_uri();

    let pkce = PkcePair::generate();
    let auth_url = client.authorization_url(&cli_config, &redirect_uri, &state, &pkce.challenge);

    on_status(&format!("Open this URL in your browser to log in:\n{}", auth_url));
    on_status(&format!("Waiting for login to complete (timeout: {}s)...", timeout_secs));

    server.wait_for_result(Duration::from_secs(timeout_secs)).await;
    let result = server.result();
    server.shutdown();

    if let Some(error) = result.error {
        return Err(AuthError::Login(error));
    }
    let code = result
        .code
        .ok_or_else(|| AuthError::Login("No authorization code received".to_string()))?;

    let tokens = client
        .exchange_code(&cli_config, &code, &redirect_uri, &pkce.verifier)
        .await?;
    let whoami = client.fetch_whoami(&tokens.access_token).await?;

    let Some(org) = whoami.selected_org() else {
        return Err(AuthError::Login(
            "No organizations found for your account. Please contact support@arcade.dev for assistance."
                .to_string(),
        ));
    };
    if whoami.selected_project().is_none() {
        return Err(AuthError::Login(format!(
            "No projects found in organization '{}'. Please contact support@arcade.dev for assistance.",
            org.name
        )));
    }

    info!(email = %whoami.email, "Login completed");
    Ok(LoginResult { tokens, whoami })
}

/// Credentials to persist after a successful login.
pub fn credentials_from_login(result: &LoginResult, coordinator_url: &str) -> Config {
    let context = match (result.selected_org(), result.selected_project()) {
        (Some(org), Some(project)) => Some(ContextConfig {
            org_id: org.org_id.clone(),
            org_name: org.name.clone(),
            project_id: project.project_id.clone(),
            project_name: project.name.clone(),
        }),
        _ => None,
    };

    Config {
        coordinator_url: Some(coordinator_url.to_string()),
        auth: Some(AuthConfig {
            access_token: result.tokens.access_token.clone(),
            refresh_token: result.tokens.refresh_token.clone(),
            expires_at: result.tokens.expires_at(),
        }),
        context,
        user: Some(UserConfig {
            email: Some(result.whoami.email.clone()),
        }),
    }
}

/// Persist a login to the credentials file and return where it was written.
pub fn save_credentials(
    result: &LoginResult,
    coordinator_url: &str,
) -> Result<std::path::PathBuf, AuthError> {
    let path = credentials_from_login(result, coordinator_url).save()?;
    info!(path = %path.display(), "Credentials saved");
    Ok(path)
}
