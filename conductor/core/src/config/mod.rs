//! TOML Configuration File Support
//!
//! Centralized configuration loading for votechat, with an optional TOML file
//! at `~/.config/votechat/votechat.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/votechat/votechat.toml` (typically `~/.config/votechat/votechat.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! base_url = "http://localhost:8000"
//! connect_timeout_ms = 10000
//!
//! [stream]
//! read_timeout_ms = 120000   # 0 disables the idle timeout
//! update_buffer = 256
//!
//! [chat]
//! default_model = "gpt-4o-mini"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server the CLI talks to when nothing else is configured
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Model requested when nothing else is configured
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Environment variable names
pub mod env {
    /// Server base URL
    pub const BASE_URL: &str = "VOTECHAT_BASE_URL";
    /// Default model
    pub const MODEL: &str = "VOTECHAT_MODEL";
    /// Idle read timeout in milliseconds (`0` disables)
    pub const READ_TIMEOUT_MS: &str = "VOTECHAT_READ_TIMEOUT_MS";
    /// Connect timeout in milliseconds
    pub const CONNECT_TIMEOUT_MS: &str = "VOTECHAT_CONNECT_TIMEOUT_MS";
}

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Base URL of the voting-graph server
    pub base_url: Option<String>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Stream section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Idle read timeout per chunk in milliseconds (0 = no timeout)
    pub read_timeout_ms: Option<u64>,

    /// Capacity of the update channel to the caller
    pub update_buffer: Option<usize>,
}

/// Chat section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Model used when the caller does not pick one
    pub default_model: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoteChatToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Stream configuration section
    pub stream: StreamToml,

    /// Chat configuration section
    pub chat: ChatToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved votechat configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct VoteChatConfig {
    /// Base URL of the voting-graph server (no trailing slash)
    pub base_url: String,

    /// HTTP connect timeout
    pub connect_timeout: Duration,

    /// Idle timeout for each chunk read (`None` = wait forever)
    pub read_timeout: Option<Duration>,

    /// Capacity of the update channel to the caller
    pub update_buffer: usize,

    /// Model used when the caller does not pick one
    pub default_model: String,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for VoteChatConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_millis(10_000),
            read_timeout: Some(Duration::from_millis(120_000)),
            update_buffer: 256,
            default_model: DEFAULT_MODEL.to_string(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl VoteChatConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would only fail later, at request time
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a base URL that is not
    /// http(s), an empty model, or a zero-sized update buffer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "base_url must start with http:// or https://, got `{}`",
                self.base_url
            )));
        }
        if self.default_model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "default_model must not be empty".to_string(),
            ));
        }
        if self.update_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "update_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `0` means "no timeout"
fn read_timeout_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/votechat/votechat.toml` or
/// `~/.config/votechat/votechat.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("votechat").join("votechat.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI arguments are not handled here; apply [`ConfigOverrides`] afterwards.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<VoteChatConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<VoteChatConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration reading environment variables through `lookup`
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(
    path: Option<PathBuf>,
    lookup: F,
) -> Result<VoteChatConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = VoteChatConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: VoteChatToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, lookup);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut VoteChatConfig, toml: &VoteChatToml) {
    if let Some(ref url) = toml.server.base_url {
        config.base_url = normalize_base_url(url);
    }
    if let Some(timeout) = toml.server.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(timeout);
    }

    if let Some(timeout) = toml.stream.read_timeout_ms {
        config.read_timeout = read_timeout_from_ms(timeout);
    }
    if let Some(buffer) = toml.stream.update_buffer {
        config.update_buffer = buffer;
    }

    if let Some(ref model) = toml.chat.default_model {
        config.default_model = model.clone();
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut VoteChatConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup(env::BASE_URL) {
        config.base_url = normalize_base_url(&url);
        config.source = ConfigSource::Env;
    }
    if let Some(model) = lookup(env::MODEL) {
        config.default_model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = lookup(env::READ_TIMEOUT_MS) {
        match timeout.parse::<u64>() {
            Ok(ms) => {
                config.read_timeout = read_timeout_from_ms(ms);
                config.source = ConfigSource::Env;
            }
            Err(_) => tracing::warn!(value = %timeout, "Ignoring invalid {}", env::READ_TIMEOUT_MS),
        }
    }
    if let Some(timeout) = lookup(env::CONNECT_TIMEOUT_MS) {
        match timeout.parse::<u64>() {
            Ok(ms) => {
                config.connect_timeout = Duration::from_millis(ms);
                config.source = ConfigSource::Env;
            }
            Err(_) => {
                tracing::warn!(value = %timeout, "Ignoring invalid {}", env::CONNECT_TIMEOUT_MS);
            }
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,

    /// Default model override
    pub default_model: Option<String>,

    /// Read timeout override (milliseconds, 0 disables)
    pub read_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the base URL
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Override the default model
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Override the read timeout
    #[must_use]
    pub fn with_read_timeout_ms(mut self, ms: u64) -> Self {
        self.read_timeout_ms = Some(ms);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base_url.is_none() && self.default_model.is_none() && self.read_timeout_ms.is_none()
    }

    /// Apply the overrides to a loaded configuration
    pub fn apply(&self, config: &mut VoteChatConfig) {
        if let Some(ref url) = self.base_url {
            config.base_url = normalize_base_url(url);
        }
        if let Some(ref model) = self.default_model {
            config.default_model = model.clone();
        }
        if let Some(ms) = self.read_timeout_ms {
            config.read_timeout = read_timeout_from_ms(ms);
        }
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }
    }
}
