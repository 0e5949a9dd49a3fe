//! Daemon configuration.
//!
//! Settings are loaded from a TOML file; every field has a default so an
//! absent file or empty document yields a usable configuration. Durations
//! use the human-friendly form ("5m", "24h").

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::RunnerConfig;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML document is invalid.
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized back to TOML.
    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The document parsed but carries an unusable value.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StewardConfig {
    /// Directory holding the durable state document.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Cadence of the reconciliation loop.
    #[serde(default = "default_ensure_interval", with = "humantime_serde")]
    pub ensure_interval: Duration,

    /// Retention of completed changes before pruning.
    #[serde(default = "default_prune_wait", with = "humantime_serde")]
    pub prune_wait: Duration,

    /// Task runner limits.
    #[serde(default)]
    pub runner: RunnerConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/steward")
}

const fn default_ensure_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

const fn default_prune_wait() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            ensure_interval: default_ensure_interval(),
            prune_wait: default_prune_wait(),
            runner: RunnerConfig::default(),
        }
    }
}

impl StewardConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.runner.max_workers == 0 {
            return Err(ConfigError::Validation(
                "runner.max_workers must be at least 1".to_string(),
            ));
        }
        if self.ensure_interval.is_zero() {
            return Err(ConfigError::Validation(
                "ensure_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = StewardConfig::from_toml("").unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/steward"));
        assert_eq!(config.ensure_interval, Duration::from_secs(300));
        assert_eq!(config.prune_wait, Duration::from_secs(86400));
        assert_eq!(config.runner.max_workers, 16);
    }

    #[test]
    fn test_full_document_round_trips() {
        let config = StewardConfig::from_toml(
            r#"
            state_dir = "/tmp/steward"
            ensure_interval = "30s"
            prune_wait = "2h"

            [runner]
            max_workers = 4
            max_retries = 2

            [runner.kind_limits]
            create-slice = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/steward"));
        assert_eq!(config.ensure_interval, Duration::from_secs(30));
        assert_eq!(config.prune_wait, Duration::from_secs(7200));
        assert_eq!(config.runner.max_workers, 4);
        assert_eq!(config.runner.kind_limits["create-slice"], 1);

        let reparsed = StewardConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(reparsed.ensure_interval, config.ensure_interval);
        assert_eq!(reparsed.prune_wait, config.prune_wait);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = StewardConfig::from_toml("[runner]\nmax_workers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = StewardConfig::from_toml("stae_dir = \"/tmp\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = StewardConfig::from_toml("ensure_interval = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
