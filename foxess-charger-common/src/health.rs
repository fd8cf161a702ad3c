//! Poll health types for consumers of the charger core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device availability status, as seen by the last poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Every register block was read.
    Online,
    /// Device is not responding (no block could be read).
    Offline,
    /// Some, but not all, register blocks were read.
    Degraded,
    /// Device status is unknown (never polled).
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health of the poll loop for one charger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Device name from configuration.
    pub device: String,
    /// Current status.
    pub status: DeviceStatus,
    /// Whether the last cycle read at least one block.
    pub healthy: bool,
    /// When the last successful cycle finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    /// When the last cycle (successful or not) finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<DateTime<Utc>>,
    /// Number of consecutive failed cycles.
    pub consecutive_failures: u32,
    /// Total cycles run.
    pub cycles_total: u64,
    /// Blocks that failed in the last cycle (e.g. "0x3000").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_blocks: Vec<String>,
    /// Last error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthReport {
    /// Report for a device that has not been polled yet.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Self::default()
        }
    }
}
