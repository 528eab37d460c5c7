//! Key loader configuration

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use kld_core::KeyLabels;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is not valid JSON for this schema
    #[error("Cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration parsed but a value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings shared by every operator flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyLoaderConfig {
    /// Token slot the HSM session is opened on
    pub slot: u64,
    /// Labels of the token-resident keys
    pub labels: KeyLabels,
    /// Timeout of device service sessions, in milliseconds
    pub device_timeout_ms: u64,
    /// Shares needed to recover the master encryption key
    pub share_threshold: u8,
    /// Shares produced for the master encryption key
    pub share_count: u8,
    /// `env_logger` filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for KeyLoaderConfig {
    fn default() -> Self {
        KeyLoaderConfig {
            slot: 0,
            labels: KeyLabels::default(),
            device_timeout_ms: 1000,
            share_threshold: 2,
            share_count: 3,
            log_filter: "info".to_string(),
        }
    }
}

impl KeyLoaderConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        text.parse()
    }

    /// Device service session timeout
    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let labels = [
            ("kld_auth", &self.labels.kld_auth),
            ("mfg_reset_master", &self.labels.mfg_reset_master),
            ("reincarnation_master", &self.labels.reincarnation_master),
            ("reincarnation_key", &self.labels.reincarnation_key),
            ("application_sign", &self.labels.application_sign),
            ("root_kbpk", &self.labels.root_kbpk),
        ];
        if let Some((name, _)) = labels.iter().find(|(_, label)| label.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("label '{}' is empty", name)));
        }
        if self.device_timeout_ms == 0 {
            return Err(ConfigError::Invalid("device_timeout_ms must be positive".to_string()));
        }
        if self.share_threshold == 0 || self.share_threshold > self.share_count {
            return Err(ConfigError::Invalid(format!(
                "share threshold {} out of range for {} shares",
                self.share_threshold, self.share_count
            )));
        }
        Ok(())
    }
}

impl FromStr for KeyLoaderConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: KeyLoaderConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
