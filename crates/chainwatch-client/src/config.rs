//! Client configuration loading from file and environment variables.

use chainwatch_types::DEFAULT_PORT;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Watch server location.
    #[serde(default)]
    pub server: ServerConfig,

    /// Poll loop pacing.
    #[serde(default)]
    pub poll: PollConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the watch server lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the watch server, without the endpoint path.
    #[serde(default = "default_server_url")]
    pub url: String,
}

/// Poll loop pacing.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// First delay after an empty or failed poll, in milliseconds.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Upper bound of the delay, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Timeout of one watch request. Must exceed the server's hold time.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_server_url() -> String {
    format!("http://127.0.0.1:{DEFAULT_PORT}")
}

fn default_backoff_initial_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl PollConfig {
    /// Timeout of one watch request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads client configuration, falling back to defaults when no path is
/// given.
///
/// Unlike the server, an explicitly named file must exist.
///
/// Environment variable overrides:
/// - `CHAINWATCH_SERVER_URL` overrides `server.url`
/// - `CHAINWATCH_LOG_LEVEL` overrides `logging.level`
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<ClientConfig, ConfigError> {
    let mut config = match path {
        Some(p) => toml::from_str(&std::fs::read_to_string(p)?)?,
        None => ClientConfig::default(),
    };

    if let Ok(url) = std::env::var("CHAINWATCH_SERVER_URL") {
        if !url.trim().is_empty() {
            config.server.url = url;
        }
    }
    if let Ok(level) = std::env::var("CHAINWATCH_LOG_LEVEL") {
        config.logging.level = level;
    }

    Ok(config)
}
