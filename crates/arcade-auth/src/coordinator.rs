//! Coordinator OAuth endpoints
//!
//! The Coordinator publishes the CLI's OAuth client configuration, issues
//! tokens, and reports which organizations and projects an account can use.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::AuthError;

pub const DEFAULT_SCOPES: &str = "openid offline_access";
pub const DEFAULT_COORDINATOR_URL: &str = "https://cloud.arcade.dev";

/// OAuth client configuration served to the CLI
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CliConfig {
    pub client_id: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(self.expires_in)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrgInfo {
    #[serde(alias = "organization_id")]
    pub org_id: String,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProjectInfo {
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WhoAmI {
    pub account_id: String,
    pub email: String,
    #[serde(default)]
    pub organizations: Vec<OrgInfo>,
    #[serde(default)]
    pub projects: Vec<ProjectInfo>,
}

impl WhoAmI {
    /// Default org if one is flagged, otherwise the first.
    pub fn selected_org(&self) -> Option<&OrgInfo> {
        self.organizations
            .iter()
            .find(|o| o.is_default)
            .or_else(|| self.organizations.first())
    }

    pub fn selected_project(&self) -> Option<&ProjectInfo> {
        self.projects
            .iter()
            .find(|p| p.is_default)
            .or_else(|| self.projects.first())
    }
}

/// Build the Coordinator base URL; `localhost` uses plain HTTP on 8000.
pub fn build_coordinator_url(host: &str, port: Option<u16>) -> String {
    let scheme = if host == "localhost" { "http" } else { "https" };
    match port {
        Some(port) => format!("{}://{}:{}", scheme, host, port),
        None if host == "localhost" => format!("{}://{}:8000", scheme, host),
        None => format!("{}://{}", scheme, host),
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn fetch_cli_config(&self) -> Result<CliConfig, AuthError> {
        let url = format!("{}/api/v1/auth/cli_config", self.base_url);
        let response = self.http.get(&url).send().await.map_err(|e| AuthError::Coordinator {
            url: self.base_url.clone(),
            message: e.to_string(),
        })?;
        let body = read_json(response).await?;
        Ok(serde_json::from_value(unwrap_data(body))?)
    }

    /// Authorization URL for the PKCE code flow.
    pub fn authorization_url(
        &self,
        config: &CliConfig,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
            config.authorization_endpoint,
            urlencoding::encode(&config.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(DEFAULT_SCOPES),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        )
    }

    pub async fn exchange_code(
        &self,
        config: &CliConfig,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, AuthError> {
        info!("Exchanging authorization code for tokens");
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", config.client_id.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ];
        self.post_token(&config.token_endpoint, &params).await
    }

    pub async fn refresh_tokens(
        &self,
        config: &CliConfig,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthError> {
        info!("Refreshing access token");
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", config.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        self.post_token(&config.token_endpoint, &params).await
    }

    pub async fn fetch_whoami(&self, access_token: &str) -> Result<WhoAmI, AuthError> {
        let url = format!("{}/api/v1/auth/whoami", self.base_url);
        let response = self.http.get(&url).bearer_auth(access_token).send().await?;
        let body = read_json(response).await?;
        Ok(serde_json::from_value(unwrap_data(body))?)
    }

    async fn post_token(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, AuthError> {
        let response = self.http.post(endpoint).form(params).send().await?;
        let body = read_json(response).await?;

        if let Some(err) = body.get("error").and_then(Value::as_str) {
            let desc = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(AuthError::TokenExchange(format!("{}: {}", err, desc)));
        }

        serde_json::from_value(body).map_err(|e| AuthError::TokenExchange(e.to_string()))
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, AuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        error!(status = status.as_u16(), "Coordinator request failed");
        return Err(AuthError::Http {
            status: status.as_u16(),
            body,
        });
    }
    let body: Value = response.json().await?;
    debug!("Coordinator response received");
    Ok(body)
}

/// Coordinator responses wrap payloads in `{"data": ...}`.
fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// In-process stand-in for the Coordinator.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use serde_json::json;

    /// Serves CLI config, token and whoami endpoints; returns the base URL.
    /// The code `good` is the only one the token endpoint accepts.
    pub(crate) async fn mock_coordinator() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let token_endpoint = format!("{}/oauth/token", base);
        let app = Router::new()
            .route(
                "/api/v1/auth/cli_config",
                get(move || {
                    let token_endpoint = token_endpoint.clone();
                    async move {
                        Json(json!({"data": {
                            "client_id": "cli",
                            "authorization_endpoint": "https://auth.example.com/authorize",
                            "token_endpoint": token_endpoint
                        }}))
                    }
                }),
            )
            .route(
                "/oauth/token",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    if form.get("code").map(String::as_str) == Some("good") {
                        Json(json!({
                            "access_token": "at",
                            "refresh_token": "rt",
                            "expires_in": 3600,
                            "token_type": "Bearer"
                        }))
                    } else {
                        Json(json!({"error": "invalid_grant", "error_description": "bad code"}))
                    }
                }),
            )
            .route(
                "/api/v1/auth/whoami",
                get(|| async {
                    Json(json!({"data": {
                        "account_id": "acct",
                        "email": "dev@example.com",
                        "organizations": [
                            {"organization_id": "o1", "name": "First"},
                            {"org_id": "o2", "name": "Second", "is_default": true}
                        ],
                        "projects": [{"project_id": "p1", "name": "Main"}]
                    }}))
                }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }
}
