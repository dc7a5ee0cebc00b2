//! Credentials file
//!
//! Stored as `credentials.json` in the Arcade work directory
//! (`ARCADE_WORK_DIR`, or `~/.arcade`). The file wraps everything in a
//! top-level `cloud` object so other sections can live alongside it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AuthError;

pub const WORK_DIR_ENV: &str = "ARCADE_WORK_DIR";
pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Tokens within this many seconds of expiry count as expired.
const EXPIRY_BUFFER_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Active organization and project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub org_id: String,
    pub org_name: String,
    pub project_id: String,
    pub project_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialsFile {
    cloud: Option<Config>,
}

impl Config {
    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    pub fn is_token_expired(&self) -> bool {
        match &self.auth {
            Some(auth) => Utc::now() >= auth.expires_at - Duration::seconds(EXPIRY_BUFFER_SECS),
            None => true,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.auth.as_ref().map(|a| a.access_token.as_str())
    }

    pub fn user_email(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.email.as_deref())
    }

    pub fn active_org_id(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.org_id.as_str())
    }

    pub fn active_project_id(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.project_id.as_str())
    }

    /// `(org_id, project_id)` of the active context
    pub fn active_context(&self) -> Result<(&str, &str), AuthError> {
        let context = self.context.as_ref().ok_or(AuthError::NoActiveContext)?;
        Ok((context.org_id.as_str(), context.project_id.as_str()))
    }

    pub fn config_dir() -> Result<PathBuf, AuthError> {
        if let Some(dir) = std::env::var_os(WORK_DIR_ENV).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        let home = dirs::home_dir().ok_or(AuthError::NoHomeDir)?;
        Ok(home.join(".arcade"))
    }

    pub fn config_file_path() -> Result<PathBuf, AuthError> {
        Ok(Self::config_dir()?.join(CREDENTIALS_FILE_NAME))
    }

    pub fn load() -> Result<Self, AuthError> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, AuthError> {
        if !path.exists() {
            return Err(AuthError::ConfigNotFound(path.to_path_buf()));
        }

        let data = fs::read_to_string(path)?;
        let file: CredentialsFile = serde_json::from_str(&data)
            .map_err(|e| AuthError::InvalidConfig(format!("{}: {}", path.display(), e)))?;

        file.cloud.ok_or_else(|| {
            AuthError::InvalidConfig(
                "Expected a 'cloud' key. Run `arcade logout`, then `arcade login` to start from a clean slate."
                    .to_string(),
            )
        })
    }

    pub fn save(&self) -> Result<PathBuf, AuthError> {
        let path = Self::config_file_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Write the file, created owner-only.
    pub fn save_to(&self, path: &Path) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = CredentialsFile {
            cloud: Some(self.clone()),
        };
        let body = serde_json::to_string_pretty(&file)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut handle = options.open(path)?;

        // `mode` only applies on creation; tighten a pre-existing file too.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = handle.set_permissions(fs::Permissions::from_mode(0o600)) {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Unable to restrict credentials file permissions"
                );
            }
        }

        handle.write_all(body.as_bytes())?;
        handle.sync_all()?;
        debug!(path = %path.display(), "Saved credentials");
        Ok(())
    }

    /// Remove the credentials file if present.
    pub fn clear(path: &Path) -> Result<bool, AuthError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
