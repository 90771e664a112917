//! Configuration management for dockside-attach.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/dockside/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::ResizeSettings;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("detach_keys is invalid: {0}")]
    InvalidDetachKeys(String),

    #[error("poll_interval_ms must be between 10 and 10000, got {0}")]
    InvalidPollInterval(u64),

    #[error("initial_retries must be at most 100, got {0}")]
    InvalidInitialRetries(u32),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("api_version must not be empty")]
    EmptyApiVersion,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Session defaults.
    pub attach: AttachConfig,

    /// Engine connection.
    pub engine: EngineConfig,

    /// Remote terminal resizing.
    pub resize: ResizeConfig,

    /// Logging output.
    pub logging: LoggingConfig,
}

/// Session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AttachConfig {
    /// Detach sequence, e.g. `ctrl-p,ctrl-q`. Empty disables detaching.
    pub detach_keys: String,

    /// Allocate a pseudo-terminal for the remote process.
    pub tty: bool,

    /// Command for `exec` when none is given.
    pub default_command: Vec<String>,
}

/// Engine connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the engine's Unix socket.
    pub socket_path: PathBuf,

    /// API version prefix for requests.
    pub api_version: String,
}

/// Remote terminal resizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResizeConfig {
    /// Polling period where no window-change signal exists.
    pub poll_interval_ms: u64,

    /// Retries after a failed initial resize.
    pub initial_retries: u32,

    /// Delay between initial resize attempts.
    pub retry_delay_ms: u64,
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Write logs to this file instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            detach_keys: protocol::DEFAULT_DETACH_KEYS_NOTATION.to_string(),
            tty: true,
            default_command: vec!["/bin/sh".to_string()],
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/docker.sock"),
            api_version: "v1.43".to_string(),
        }
    }
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            initial_retries: 5,
            retry_delay_ms: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl ResizeConfig {
    /// Timing settings for the resize monitor.
    pub fn settings(&self) -> ResizeSettings {
        ResizeSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            initial_retries: self.initial_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

impl AttachConfig {
    /// The detach sequence as bytes.
    pub fn detach_key_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        protocol::parse_detach_keys(&self.detach_keys)
            .map_err(|_| ConfigError::InvalidDetachKeys(self.detach_keys.clone()))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dockside")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DOCKSIDE_DETACH_KEYS: Override the detach sequence
    /// - DOCKSIDE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - DOCKER_HOST: Override the engine socket (`unix://` only)
    pub fn apply_env_overrides(&mut self) {
        // Unlike the others, an empty value is meaningful: it disables detaching.
        if let Ok(keys) = std::env::var("DOCKSIDE_DETACH_KEYS") {
            tracing::info!("Overriding detach_keys from environment: {:?}", keys);
            self.attach.detach_keys = keys;
        }

        if let Ok(level) = std::env::var("DOCKSIDE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(host) = std::env::var("DOCKER_HOST") {
            match host.strip_prefix("unix://") {
                Some(path) if !path.is_empty() => {
                    tracing::info!("Overriding engine socket from environment: {}", path);
                    self.engine.socket_path = PathBuf::from(path);
                }
                _ if host.is_empty() => {}
                _ => tracing::warn!("Ignoring DOCKER_HOST {}: only unix:// is supported", host),
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.attach.detach_key_bytes()?;

        let poll = self.resize.poll_interval_ms;
        if !(10..=10_000).contains(&poll) {
            return Err(ConfigError::InvalidPollInterval(poll));
        }

        if self.resize.initial_retries > 100 {
            return Err(ConfigError::InvalidInitialRetries(self.resize.initial_retries));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        if self.engine.api_version.trim().is_empty() {
            return Err(ConfigError::EmptyApiVersion);
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.attach.detach_keys, "ctrl-p,ctrl-q");
        assert!(config.attach.tty);
        assert_eq!(config.attach.default_command, vec!["/bin/sh"]);
        assert_eq!(config.engine.socket_path, PathBuf::from("/var/run/docker.sock"));
        assert_eq!(config.engine.api_version, "v1.43");
        assert_eq!(config.resize.poll_interval_ms, 250);
        assert_eq!(config.resize.initial_retries, 5);
        assert_eq!(config.resize.retry_delay_ms, 10);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resize_settings() {
        let settings = ResizeConfig::default().settings();
        assert_eq!(settings, ResizeSettings::default());
    }

    #[test]
    fn test_detach_key_bytes() {
        let config = AttachConfig::default();
        assert_eq!(config.detach_key_bytes().unwrap(), vec![0x10, 0x11]);

        let config = AttachConfig {
            detach_keys: String::new(),
            ..Default::default()
        };
        assert!(config.detach_key_bytes().unwrap().is_empty());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[attach]
detach_keys = "ctrl-x"

[resize]
poll_interval_ms = 500
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.attach.detach_keys, "ctrl-x");
        assert_eq!(config.resize.poll_interval_ms, 500);
        // Other values should be defaults
        assert!(config.attach.tty);
        assert_eq!(config.resize.initial_retries, 5);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[attach]
detach_keys = "ctrl-a,d"
tty = false
default_command = ["/bin/bash", "-l"]

[engine]
socket_path = "/run/user/1000/docker.sock"
api_version = "v1.41"

[resize]
poll_interval_ms = 100
initial_retries = 10
retry_delay_ms = 20

[logging]
level = "debug"
file = "/tmp/dockside.log"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.attach.detach_key_bytes().unwrap(), vec![0x01, b'd']);
        assert!(!config.attach.tty);
        assert_eq!(config.attach.default_command, vec!["/bin/bash", "-l"]);
        assert_eq!(
            config.engine.socket_path,
            PathBuf::from("/run/user/1000/docker.sock")
        );
        assert_eq!(config.engine.api_version, "v1.41");
        assert_eq!(config.resize.initial_retries, 10);
        assert_eq!(config.resize.retry_delay_ms, 20);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/dockside.log")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[attach\ntty = true\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[resize]
initial_retries = "lots"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.attach.detach_keys = "ctrl-]".to_string();
        original.logging.file = Some(PathBuf::from("/var/log/dockside.log"));

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[attach]"));
        assert!(toml.contains("[engine]"));
        assert!(toml.contains("[resize]"));
        assert!(toml.contains("[logging]"));

        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_validate_detach_keys() {
        let mut config = Config::default();
        config.attach.detach_keys = "ctrl-1".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDetachKeys("ctrl-1".to_string()))
        );
    }

    #[test]
    fn test_validate_poll_interval_bounds() {
        let mut config = Config::default();

        config.resize.poll_interval_ms = 10;
        assert!(config.validate().is_ok());
        config.resize.poll_interval_ms = 10_000;
        assert!(config.validate().is_ok());

        config.resize.poll_interval_ms = 9;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(9)));
        config.resize.poll_interval_ms = 10_001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPollInterval(10_001))
        );
    }

    #[test]
    fn test_validate_retries() {
        let mut config = Config::default();
        config.resize.initial_retries = 100;
        assert!(config.validate().is_ok());
        config.resize.initial_retries = 101;
        assert_eq!(config.validate(), Err(ConfigError::InvalidInitialRetries(101)));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_api_version() {
        let mut config = Config::default();
        config.engine.api_version = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyApiVersion));
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.logging.level = "trace".to_string();
        original.resize.initial_retries = 2;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("dockside"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_detach_keys() {
        std::env::set_var("DOCKSIDE_DETACH_KEYS", "ctrl-e");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.attach.detach_keys, "ctrl-e");

        std::env::remove_var("DOCKSIDE_DETACH_KEYS");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_detach_keys_disables() {
        std::env::set_var("DOCKSIDE_DETACH_KEYS", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert!(config.attach.detach_key_bytes().unwrap().is_empty());

        std::env::remove_var("DOCKSIDE_DETACH_KEYS");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("DOCKSIDE_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "debug");

        std::env::remove_var("DOCKSIDE_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_log_level_ignored() {
        std::env::set_var("DOCKSIDE_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "info");

        std::env::remove_var("DOCKSIDE_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_docker_host() {
        std::env::set_var("DOCKER_HOST", "unix:///run/docker-rootless.sock");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(
            config.engine.socket_path,
            PathBuf::from("/run/docker-rootless.sock")
        );

        std::env::set_var("DOCKER_HOST", "tcp://10.0.0.1:2375");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.engine.socket_path, PathBuf::from("/var/run/docker.sock"));

        std::env::remove_var("DOCKER_HOST");
    }
}
