//! Client configuration.
//!
//! A [`ClientConfig`] can be built in code, loaded from a TOML file, or
//! assembled from CLI flags. Durations are stored as milliseconds so the
//! file format stays flat:
//!
//! ```toml
//! endpoints = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
//! dial_timeout_ms = 3000
//! request_timeout_ms = 10000
//! auto_sync_interval_ms = 30000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings of a [`Client`](crate::client::Client).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Store endpoints, `host:port` or full URLs.
    pub endpoints: Vec<String>,

    /// Upper bound on establishing a connection.
    pub dial_timeout_ms: u64,

    /// Upper bound on each individual remote call. Paged reads apply it
    /// per page.
    pub request_timeout_ms: u64,

    /// Period of the background member sync. 0 disables it.
    pub auto_sync_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            dial_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
            auto_sync_interval_ms: 0,
        }
    }
}

impl ClientConfig {
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Invalid("at least one endpoint is required".into()));
        }
        if self.endpoints.iter().any(|ep| ep.trim().is_empty()) {
            return Err(ConfigError::Invalid("endpoints must not be blank".into()));
        }
        if self.dial_timeout_ms == 0 {
            return Err(ConfigError::Invalid("dial_timeout_ms must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn auto_sync_interval(&self) -> Option<Duration> {
        (self.auto_sync_interval_ms > 0).then(|| Duration::from_millis(self.auto_sync_interval_ms))
    }
}
