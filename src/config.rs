//! YAML configuration file.
//!
//! ```yaml
//! interface: 0
//! debug:
//! logfile: ~/plantgw.log
//! mqtt:
//!   server: broker.local
//!   prefix: plants
//! sensors:
//!   - mac: C4:7C:8D:60:D6:1C
//!     alias: basil
//!     fail_silent:
//! ```
//!
//! Keys whose mere presence enables something (`debug`, `fail_silent`) may be
//! left without a value.

use crate::retry::{OperationRetry, RoundBackoff};
use crate::sensor::{SensorConfig, presence_flag};
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Where the configuration is looked up when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "~/.plantgw.yaml";

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] serde_yaml::Error),

    #[error("IO error reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            message: message.into(),
        }
    }
}

/// The complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    /// HCI adapter index
    #[serde(default)]
    pub interface: u16,
    #[serde(default, deserialize_with = "presence_flag")]
    pub debug: bool,
    /// Log to this file instead of stderr
    #[serde(default)]
    pub logfile: Option<PathBuf>,
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    pub sensors: Vec<SensorConfig>,
}

/// Broker connection and topic layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MqttSettings {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub prefix: String,
    #[serde(default = "default_true")]
    pub trailing_slash: bool,
    #[serde(default)]
    pub timestamp_format: Option<String>,
}

fn default_port() -> u16 {
    8883
}

fn default_client_id() -> String {
    "plantgateway".to_string()
}

fn default_true() -> bool {
    true
}

/// Tuning for both retry levels. Durations accept `500ms`, `3s`, `1m`, `2h`
/// or a bare number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub operation_attempts: u32,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub operation_delay: Duration,
    pub rounds: u32,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub round_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let operation = OperationRetry::default();
        let rounds = RoundBackoff::default();
        Self {
            operation_attempts: operation.attempts,
            operation_delay: operation.base_delay,
            rounds: rounds.rounds,
            round_delay: rounds.base_delay,
        }
    }
}

impl RetrySettings {
    pub fn operation_retry(&self) -> OperationRetry {
        OperationRetry {
            attempts: self.operation_attempts,
            base_delay: self.operation_delay,
        }
    }

    pub fn round_backoff(&self) -> RoundBackoff {
        RoundBackoff {
            rounds: self.rounds,
            base_delay: self.round_delay,
        }
    }
}

impl Settings {
    /// Parse and validate a YAML document.
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings = serde_yaml::from_str(source)?;
        settings.validate()?;
        settings.logfile = settings.logfile.as_deref().map(expand_home);
        Ok(settings)
    }

    /// Load the configuration file at `path`, expanding a leading `~`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let path = expand_home(path);
        if !path.exists() {
            return Err(ConfigError::FileNotFound { path });
        }
        let source = std::fs::read_to_string(&path)?;
        Self::from_yaml(&source)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.server.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.server must not be empty"));
        }
        if self.mqtt.prefix.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.prefix must not be empty"));
        }
        if let Some(format) = &self.mqtt.timestamp_format
            && StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
        {
            return Err(ConfigError::invalid(format!(
                "mqtt.timestamp_format '{format}' is not a valid strftime pattern"
            )));
        }
        if self.retry.operation_attempts == 0 {
            return Err(ConfigError::invalid("retry.operation_attempts must be at least 1"));
        }
        if self.retry.rounds == 0 {
            return Err(ConfigError::invalid("retry.rounds must be at least 1"));
        }
        if self.sensors.is_empty() {
            return Err(ConfigError::invalid("at least one sensor must be configured"));
        }
        Ok(())
    }
}

/// Replace a leading `~` with the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
