//! Configuration for the charger core.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use foxess_charger_common::config::LoggingConfig;

use crate::poller::PollerSettings;
use crate::registers::RegisterMap;
use crate::transport::TcpSettings;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete charger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerConfig {
    /// The charger to poll
    pub device: DeviceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection and polling settings for the charger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (used in logs and the health report)
    pub name: String,

    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (1-65535, default: 1502)
    #[serde(default = "default_port")]
    pub port: u32,

    /// Modbus unit/slave ID (1-255)
    #[serde(default = "default_unit_id")]
    pub unit_id: u32,

    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Connection and transaction timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_port() -> u32 {
    1502
}

fn default_unit_id() -> u32 {
    1
}

fn default_poll_interval() -> u64 {
    5
}

fn default_timeout_ms() -> u64 {
    5000
}

const MAX_POLL_INTERVAL_SECS: u64 = 300;
const MAX_TIMEOUT_MS: u64 = 60_000;

impl ChargerConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json5(&content)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let config: ChargerConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let device = &self.device;

        if device.name.is_empty() {
            return Err(ConfigError::Validation(
                "Device name cannot be empty".to_string(),
            ));
        }

        if device.host.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Device '{}': host cannot be empty",
                device.name
            )));
        }

        // json5 saturates out-of-range integers, so the fields are read
        // wider than the wire types and range-checked here.
        if !(1..=255).contains(&device.unit_id) {
            return Err(ConfigError::Validation(format!(
                "Device '{}': unit_id must be 1-255",
                device.name
            )));
        }

        if !(1..=65535).contains(&device.port) {
            return Err(ConfigError::Validation(format!(
                "Device '{}': port must be 1-65535",
                device.name
            )));
        }

        if !(1..=MAX_POLL_INTERVAL_SECS).contains(&device.poll_interval_secs) {
            return Err(ConfigError::Validation(format!(
                "Device '{}': poll_interval_secs must be 1-{}",
                device.name, MAX_POLL_INTERVAL_SECS
            )));
        }

        if !(1..=MAX_TIMEOUT_MS).contains(&device.timeout_ms) {
            return Err(ConfigError::Validation(format!(
                "Device '{}': timeout_ms must be 1-{}",
                device.name, MAX_TIMEOUT_MS
            )));
        }

        Ok(())
    }
}

impl DeviceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Settings for the Modbus TCP transport.
    pub fn tcp_settings(&self) -> Result<TcpSettings, ConfigError> {
        let port = u16::try_from(self.port).map_err(|_| {
            ConfigError::Validation(format!(
                "Device '{}': port {} is out of range",
                self.name, self.port
            ))
        })?;
        let unit_id = u8::try_from(self.unit_id).map_err(|_| {
            ConfigError::Validation(format!(
                "Device '{}': unit_id {} is out of range",
                self.name, self.unit_id
            ))
        })?;

        Ok(TcpSettings {
            host: self.host.clone(),
            port,
            unit_id,
            timeout: self.timeout(),
        })
    }

    /// Settings for the poller reading `map`.
    pub fn poller_settings(&self, map: &RegisterMap) -> PollerSettings {
        PollerSettings::new(self.name.clone(), self.poll_interval(), self.timeout(), map)
    }
}
