//! Configuration system for the correlation agent
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of the writer settings the client depends on

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

/// Largest queue or pool size: tokio's semaphore limit, further capped so a
/// whole pool can be acquired in one `acquire_many` call
pub const MAX_CAPACITY: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent settings
    pub agent: AgentSettings,

    /// Correlation writer settings
    pub writer: WriterConfig,
}

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Settings consumed by the correlation client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Access token sent with every request
    pub access_token: String,

    /// Base URL of the correlation API
    pub api_url: String,

    /// Capacity of the submission queue, the retry queue and the dedup table
    pub max_buffered: usize,

    /// Maximum concurrent outbound requests
    pub max_requests: usize,

    /// Fixed delay before a failed request is re-sent, in milliseconds
    pub send_delay_ms: u64,

    /// Retries after the original attempt
    pub max_retries: u32,

    /// Log every successful update at info level
    pub log_updates: bool,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            api_url: "https://api.signalfx.com".to_string(),
            max_buffered: 10_000,
            max_requests: 20,
            send_delay_ms: 30_000,
            max_retries: 2,
            log_updates: false,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl WriterConfig {
    /// Get the retry delay as Duration
    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    /// Get the request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Total attempts per request, counting the original one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Parse the API URL, rejecting anything that is not http(s)
    pub fn parsed_api_url(&self) -> ConfigResult<Url> {
        let url = Url::parse(&self.api_url).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid API URL {}: {}", self.api_url, e))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid API URL scheme: {}. Must be http or https",
                other
            ))),
        }
    }

    /// Check the settings the client cannot run without
    pub fn validate(&self) -> ConfigResult<()> {
        self.parsed_api_url()?;

        if self.max_buffered == 0 {
            return Err(ConfigError::ValidationError(
                "max_buffered cannot be 0".to_string(),
            ));
        }

        if self.max_requests == 0 {
            return Err(ConfigError::ValidationError(
                "max_requests cannot be 0".to_string(),
            ));
        }

        if self.max_buffered > MAX_CAPACITY || self.max_requests > MAX_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "max_buffered and max_requests cannot exceed {}",
                MAX_CAPACITY
            )));
        }

        Ok(())
    }
}

/// Configuration loader with discovery and env overrides
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. APM_CORRELATE_CONFIG environment variable
    /// 3. ~/.config/apm-correlate/config.toml
    /// 4. /etc/apm-correlate/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<AgentConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            AgentConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("APM_CORRELATE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("APM_CORRELATE_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/apm-correlate/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<AgentConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AgentConfig) {
        if let Ok(val) = std::env::var("APM_CORRELATE_LOG_LEVEL") {
            config.agent.log_level = val;
        }

        let writer = &mut config.writer;
        if let Ok(val) = std::env::var("APM_CORRELATE_ACCESS_TOKEN") {
            writer.access_token = val;
        }
        if let Ok(val) = std::env::var("APM_CORRELATE_API_URL") {
            writer.api_url = val;
        }
        if let Ok(val) = std::env::var("APM_CORRELATE_MAX_BUFFERED") {
            writer.max_buffered = val.parse().unwrap_or(writer.max_buffered);
        }
        if let Ok(val) = std::env::var("APM_CORRELATE_MAX_REQUESTS") {
            writer.max_requests = val.parse().unwrap_or(writer.max_requests);
        }
        if let Ok(val) = std::env::var("APM_CORRELATE_SEND_DELAY_MS") {
            writer.send_delay_ms = val.parse().unwrap_or(writer.send_delay_ms);
        }
        if let Ok(val) = std::env::var("APM_CORRELATE_MAX_RETRIES") {
            writer.max_retries = val.parse().unwrap_or(writer.max_retries);
        }
        if let Ok(val) = std::env::var("APM_CORRELATE_LOG_UPDATES") {
            writer.log_updates = val.parse().unwrap_or(writer.log_updates);
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &AgentConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.agent.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.agent.log_level, valid_levels
            )));
        }

        config.writer.validate()
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .map(|d| d.join("apm-correlate").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
