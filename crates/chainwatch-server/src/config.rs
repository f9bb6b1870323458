//! Server configuration loading from file and environment variables.

use chainwatch_types::{CursorType, DEFAULT_PORT};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Chain database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Watch endpoint behavior.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Retention sweeper settings.
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Chain database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled read connections serving watch requests.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "chainwatch_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Watch endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// How long a cursor watch waits for new events before answering
    /// "nothing new".
    #[serde(default = "default_hold_timeout_secs")]
    pub hold_timeout_secs: u64,

    /// Pause between chain scans while holding, in milliseconds.
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    /// Maximum chain nodes scanned per request.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Watchable resource types. Only these are bootstrapped and served.
    #[serde(default = "default_resources")]
    pub resources: Vec<CursorType>,
}

/// Retention sweeper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Seconds between purges of expired chain nodes.
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_path() -> String {
    "chainwatch.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_hold_timeout_secs() -> u64 {
    20
}

fn default_loop_interval_ms() -> u64 {
    250
}

fn default_batch_limit() -> usize {
    200
}

fn default_resources() -> Vec<CursorType> {
    CursorType::ALL.to_vec()
}

fn default_retention_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
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

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            hold_timeout_secs: default_hold_timeout_secs(),
            loop_interval_ms: default_loop_interval_ms(),
            batch_limit: default_batch_limit(),
            resources: default_resources(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retention_interval_secs(),
        }
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

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CHAINWATCH_HOST` overrides `server.host`
/// - `CHAINWATCH_PORT` overrides `server.port`
/// - `CHAINWATCH_DB_PATH` overrides `database.path`
/// - `CHAINWATCH_LOG_LEVEL` overrides `logging.level`
/// - `CHAINWATCH_LOG_JSON` overrides `logging.json` ("true" or "1")
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("CHAINWATCH_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("CHAINWATCH_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("CHAINWATCH_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("CHAINWATCH_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("CHAINWATCH_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.database.pool_max_size, 8);
        assert_eq!(config.watch.hold_timeout_secs, 20);
        assert_eq!(config.watch.loop_interval_ms, 250);
        assert_eq!(config.watch.batch_limit, 200);
        assert_eq!(config.watch.resources.len(), CursorType::ALL.len());
        assert_eq!(config.retention.interval_secs, 60);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [watch]
            hold_timeout_secs = 5
            resources = ["host", "object_instance"]

            [database]
            path = "/var/lib/chainwatch/chain.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.watch.hold_timeout_secs, 5);
        assert_eq!(config.watch.batch_limit, 200);
        assert_eq!(
            config.watch.resources,
            vec![CursorType::Host, CursorType::ObjectInstance]
        );
        assert_eq!(config.database.path, "/var/lib/chainwatch/chain.db");
        assert_eq!(config.database.busy_timeout_ms, 5_000);
    }

    #[test]
    fn unknown_resource_is_a_parse_error() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [watch]
            resources = ["kube_pod"]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.watch.batch_limit, 200);
    }

    #[test]
    fn file_is_read_and_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retention]\ninterval_secs = 7").unwrap();
        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.retention.interval_secs, 7);
    }
}
