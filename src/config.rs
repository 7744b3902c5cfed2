use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::net::Host;

// Define error types for configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("credential error: {0}")]
    Credential(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Credential sections for credentials.toml
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RedditAuth {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImgurAuth {
    pub client_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Credentials {
    pub reddit: RedditAuth,
    pub imgur: ImgurAuth,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            reddit: RedditAuth {
                client_id: "your_client_id".to_string(),
                client_secret: "your_client_secret".to_string(),
                user_agent: format!("redharvest/{} (by your_username)", env!("CARGO_PKG_VERSION")),
            },
            imgur: ImgurAuth {
                client_id: "your_imgur_client_id".to_string(),
            },
        }
    }
}

impl Credentials {
    /// Load credentials from a TOML file. A missing file is replaced with a
    /// placeholder template, which is reported as a credential error so the
    /// run aborts before any authenticated call is attempted.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            let default_credentials = Self::default();
            let toml_string = toml::to_string_pretty(&default_credentials)
                .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            fs::write(path, toml_string)?;
            info!("Created credential template at {}", path.display());
            return Err(ConfigError::Credential(format!(
                "no credentials found; a template was written to {} - fill in your API keys",
                path.display()
            )));
        }

        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    // Check if Reddit credentials are configured and not placeholders
    pub fn has_valid_reddit(&self) -> bool {
        !self.reddit.client_id.is_empty()
            && !self.reddit.client_secret.is_empty()
            && self.reddit.client_id != "your_client_id"
            && self.reddit.client_secret != "your_client_secret"
    }

    // Check if Imgur credentials are configured and not placeholders
    pub fn has_valid_imgur(&self) -> bool {
        !self.imgur.client_id.is_empty() && self.imgur.client_id != "your_imgur_client_id"
    }
}

/// Request budget for one host: the smallest gap between requests, the
/// ceiling for throttle-driven backoff, and how often a failed request is
/// retried before its outcome is reported.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostPolicy {
    pub min_interval_ms: u64,
    pub backoff_ceiling_secs: u64,
    pub max_retries: usize,
}

/// Per-host policy table, injected into the rate limiter at construction.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostPolicies {
    pub reddit: HostPolicy,
    pub imgur: HostPolicy,
    pub generic: HostPolicy,
}

impl Default for HostPolicies {
    fn default() -> Self {
        Self {
            reddit: HostPolicy {
                min_interval_ms: 100,
                backoff_ceiling_secs: 60,
                max_retries: 3,
            },
            // Imgur allows 12500 client requests per day and blocks the IP
            // for a month when exceeded, so its floor is much higher.
            imgur: HostPolicy {
                min_interval_ms: 2_000,
                backoff_ceiling_secs: 60,
                max_retries: 3,
            },
            generic: HostPolicy {
                min_interval_ms: 100,
                backoff_ceiling_secs: 60,
                max_retries: 3,
            },
        }
    }
}

impl HostPolicies {
    pub fn policy(&self, host: Host) -> &HostPolicy {
        match host {
            Host::Reddit => &self.reddit,
            Host::Imgur => &self.imgur,
            Host::Generic => &self.generic,
        }
    }
}
