//! User-configurable peripheral settings
//!
//! Settings that shape how the peripheral presents itself:
//! - Connectable/discoverable advertising
//! - Default advertising timeout
//! - Log filter used when bootstrapping tracing

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Longest advertising timeout accepted (one hour)
pub const MAX_ADVERTISING_TIMEOUT_MS: u64 = 3_600_000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingsError {
    #[error("Invalid advertising timeout: must be 1-{max} ms, got {0}", max = MAX_ADVERTISING_TIMEOUT_MS)]
    InvalidAdvertisingTimeout(u64),

    #[error("Invalid log filter: cannot be empty")]
    EmptyLogFilter,

    #[error("Invalid settings combination: {0}")]
    InvalidCombination(String),
}

// ============================================================================
// PERIPHERAL SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralSettings {
    /// Accept connections from centrals that see the advertisement
    pub connectable: bool,

    /// Advertise in general discoverable mode
    pub discoverable: bool,

    /// Timeout applied when `start_advertising` is called without one
    pub default_advertising_timeout_ms: Option<u64>,

    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for PeripheralSettings {
    fn default() -> Self {
        Self {
            connectable: true,
            discoverable: true,
            default_advertising_timeout_ms: None,
            log_filter: "info".to_string(),
        }
    }
}

impl PeripheralSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if let Some(timeout) = self.default_advertising_timeout_ms {
            if timeout == 0 || timeout > MAX_ADVERTISING_TIMEOUT_MS {
                return Err(SettingsError::InvalidAdvertisingTimeout(timeout));
            }
        }

        if self.log_filter.trim().is_empty() {
            return Err(SettingsError::EmptyLogFilter);
        }

        // A non-connectable, non-discoverable advertisement announces nothing
        if !self.connectable && !self.discoverable {
            return Err(SettingsError::InvalidCombination(
                "advertising must be connectable or discoverable".to_string(),
            ));
        }

        Ok(())
    }

    pub fn default_advertising_timeout(&self) -> Option<Duration> {
        self.default_advertising_timeout_ms
            .map(Duration::from_millis)
    }

    /// Update a single field from its string form (used by the CLI)
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut updated = self.clone();
        match key {
            "connectable" => updated.connectable = parse_bool(key, value)?,
            "discoverable" => updated.discoverable = parse_bool(key, value)?,
            "default_advertising_timeout_ms" => {
                updated.default_advertising_timeout_ms = match value {
                    "" | "none" => None,
                    other => Some(other.parse().map_err(|_| {
                        SettingsError::InvalidCombination(format!(
                            "default_advertising_timeout_ms expects a number, got {other}"
                        ))
                    })?),
                }
            }
            "log_filter" => updated.log_filter = value.to_string(),
            other => {
                return Err(SettingsError::InvalidCombination(format!(
                    "unknown setting: {other}"
                )))
            }
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    value.parse().map_err(|_| {
        SettingsError::InvalidCombination(format!("{key} expects true/false, got {value}"))
    })
}
