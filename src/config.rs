use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of one endpoint. Every field has a default, so a config file only lists
/// what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub name: String,
    /// Address to accept peers on, e.g. `127.0.0.1:6170`.
    pub listen: Option<String>,
    /// Longest wait of one reactor pass.
    pub idle_timeout_ms: u64,
    /// Silence after which a network peer is dropped; 0 disables the timeout.
    pub connection_timeout_s: u64,
    pub max_parse_errors: u32,
    pub max_record_size: usize,
    /// Default wall-clock limit for forked helpers; 0 means none.
    pub fork_timeout_s: u64,
    pub log_level: String,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            name: "obsbus".to_string(),
            listen: None,
            idle_timeout_ms: 1000,
            connection_timeout_s: 300,
            max_parse_errors: 10,
            max_record_size: crate::protocol::MAX_RECORD_SIZE,
            fork_timeout_s: 0,
            log_level: "info".to_string(),
        }
    }
}

impl BlockConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "name '{}' must be a single non-empty token",
                self.name
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_record_size < 64 {
            return Err(ConfigError::Invalid(format!(
                "max_record_size {} is too small",
                self.max_record_size
            )));
        }
        if !matches!(
            self.log_level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::Invalid(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_s > 0).then(|| Duration::from_secs(self.connection_timeout_s))
    }

    pub fn fork_timeout(&self) -> Option<Duration> {
        (self.fork_timeout_s > 0).then(|| Duration::from_secs(self.fork_timeout_s))
    }
}
