//! Configuration loader and validator for the feed synchronization client.
use chrono::{FixedOffset, Offset, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub api: Api,
    #[serde(default)]
    pub feed: Feed,
    #[serde(default)]
    pub push: Push,
    #[serde(default)]
    pub session: Option<SessionSeed>,
}

/// Backend endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Offset of the zone the backend uses when it turns local timestamps
    /// into epoch millis for recency cursors.
    #[serde(default)]
    pub server_utc_offset_minutes: i32,
}

/// Pagination and event fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feed {
    pub page_size: u32,
    pub event_capacity: usize,
}

/// Push channel reconnection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Push {
    pub reconnect_delay_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Credential used by the CLI to start an authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSeed {
    pub token: String,
    pub user_id: i64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for Feed {
    fn default() -> Self {
        Self {
            page_size: 10,
            event_capacity: 64,
        }
    }
}

impl Default for Push {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 500,
            max_backoff_seconds: 60,
        }
    }
}

impl Config {
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let mut raw = self.api.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|_| ConfigError::Invalid("api.base_url must be a valid URL"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.api.timeout_ms)
    }

    /// Falls back to UTC for offsets `validate` would reject.
    pub fn server_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.api.server_utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.api.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("api.base_url must be non-empty"));
    }
    cfg.base_url()?;
    if cfg.api.timeout_ms == 0 {
        return Err(ConfigError::Invalid("api.timeout_ms must be > 0"));
    }
    // A day either side of UTC covers every real zone.
    if cfg.api.server_utc_offset_minutes.abs() >= 24 * 60 {
        return Err(ConfigError::Invalid(
            "api.server_utc_offset_minutes must be within one day",
        ));
    }

    if cfg.feed.page_size == 0 {
        return Err(ConfigError::Invalid("feed.page_size must be > 0"));
    }
    if cfg.feed.event_capacity == 0 {
        return Err(ConfigError::Invalid("feed.event_capacity must be > 0"));
    }

    if cfg.push.reconnect_delay_ms == 0 {
        return Err(ConfigError::Invalid("push.reconnect_delay_ms must be > 0"));
    }

    if let Some(seed) = &cfg.session {
        if seed.token.trim().is_empty() {
            return Err(ConfigError::Invalid("session.token must be non-empty"));
        }
    }

    Ok(())
}

/// Returns the example YAML shipped with the CLI.
pub fn example() -> &'static str {
    r#"api:
  base_url: "http://localhost:8080/"
  timeout_ms: 10000
  server_utc_offset_minutes: 480

feed:
  page_size: 10
  event_capacity: 64

push:
  reconnect_delay_ms: 500
  max_backoff_seconds: 60

session:
  token: "YOUR_BEARER_TOKEN"
  user_id: 1
"#
}
