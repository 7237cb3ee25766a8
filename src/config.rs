//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `WAYPOINT_*` environment variable overrides.

use crate::writer::WriterConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Port devices connect to
    #[serde(default = "default_device_port")]
    pub device_port: u16,

    /// Port serving the live websocket channel
    #[serde(default = "default_web_port")]
    pub web_port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_device_port() -> u16 {
    7000
}

fn default_web_port() -> u16 {
    7001
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            device_port: default_device_port(),
            web_port: default_web_port(),
        }
    }
}

impl ServerConfig {
    pub fn device_addr(&self) -> String {
        format!("{}:{}", self.host, self.device_port)
    }

    pub fn web_addr(&self) -> String {
        format!("{}:{}", self.host, self.web_port)
    }
}

/// Backing store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_uri")]
    pub uri: String,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_store_uri() -> String {
    "sqlite://waypoint.db".to_string()
}

fn default_flush_interval() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: default_store_uri(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

impl StoreConfig {
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        for path in default_config_paths() {
            if path.exists() {
                match Self::load_with_env(&path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply `WAYPOINT_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("WAYPOINT_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("WAYPOINT_DEVICE_PORT").and_then(|p| p.parse().ok()) {
            self.server.device_port = port;
        }
        if let Some(port) = var("WAYPOINT_WEB_PORT").and_then(|p| p.parse().ok()) {
            self.server.web_port = port;
        }

        if let Some(uri) = var("WAYPOINT_STORE_URI") {
            self.store.uri = uri;
        }
        if let Some(secs) = var("WAYPOINT_FLUSH_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            self.store.flush_interval_secs = secs;
        }

        if let Some(level) = var("WAYPOINT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("WAYPOINT_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    [
        dirs::config_dir().map(|p| p.join("waypoint").join("config.toml")),
        Some(PathBuf::from("/etc/waypoint/config.toml")),
        Some(PathBuf::from("./waypoint.toml")),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Waypoint Configuration
#
# Environment variables override these settings:
# - WAYPOINT_HOST
# - WAYPOINT_DEVICE_PORT
# - WAYPOINT_WEB_PORT
# - WAYPOINT_STORE_URI
# - WAYPOINT_FLUSH_INTERVAL_SECS
# - WAYPOINT_LOG_LEVEL
# - WAYPOINT_LOG_FORMAT

[server]
# Interface to bind both listeners on
host = "0.0.0.0"

# Port devices connect to (length-prefixed JSON frames)
device_port = 7000

# Port for the live websocket channel (/ws) and /health
web_port = 7001

[store]
# sqlite://<path>, sqlite::memory: or memory://
uri = "sqlite://waypoint.db"

# Seconds between batched writes to the store
flush_interval_secs = 30

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
