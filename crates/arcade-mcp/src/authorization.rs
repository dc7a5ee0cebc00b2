//! Tool authorization against the Arcade Engine

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::catalog::AuthRequirement;
use crate::error::{ServerError, ToolError};

pub const DEFAULT_ENGINE_URL: &str = "https://api.arcade.dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    NotStarted,
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationContext {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_info: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub status: AuthorizationStatus,
    #[serde(default, alias = "authorization_url")]
    pub url: Option<String>,
    #[serde(default)]
    pub context: Option<AuthorizationContext>,
}

impl AuthorizationResponse {
    pub fn is_completed(&self) -> bool {
        self.status == AuthorizationStatus::Completed
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        requirement: &AuthRequirement,
        user_id: &str,
    ) -> Result<AuthorizationResponse, ToolError>;
}

/// Calls `POST {engine_url}/v1/auth/authorize` with the API key.
#[derive(Debug, Clone)]
pub struct ArcadeAuthorizer {
    engine_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl ArcadeAuthorizer {
    pub fn new(
        engine_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ServerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServerError::Transport(e.to_string()))?;
        Ok(Self {
            engine_url: engine_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }

    pub fn engine_url(&self) -> &str {
        &self.engine_url
    }
}

#[async_trait]
impl Authorizer for ArcadeAuthorizer {
    async fn authorize(
        &self,
        requirement: &AuthRequirement,
        user_id: &str,
    ) -> Result<AuthorizationResponse, ToolError> {
        let url = format!("{}/v1/auth/authorize", self.engine_url);
        let body = json!({
            "auth_requirement": requirement,
            "user_id": user_id,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(url = %url, error = %e, "Authorization request failed");
                ToolError::upstream(format!("Authorization request failed: {}", e), 502)
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response.text().await.unwrap_or_default();
            return Err(ToolError::from_http_status(status.as_u16(), retry_after.as_deref(), &text));
        }

        let parsed: AuthorizationResponse = response
            .json()
            .await
            .map_err(|e| {
                ToolError::upstream(format!("Invalid authorization response: {}", e), 502)
            })?;
        debug!(status = ?parsed.status, user_id, "Authorization response");
        Ok(parsed)
    }
}
