//! Client timing configuration. Built in code or parsed from TOML text.

use std::time::Duration;

use serde::Deserialize;

use crate::watcher::{AvailabilitySchedule, FixedSchedule};

/// Probe deadline and watcher intervals. Every field has a default, so an
/// empty document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Time to wait for a pong (default 500 ms).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Initial availability attempts retried without delay (default 5).
    #[serde(default = "default_settling_attempts")]
    pub settling_attempts: u32,
    /// Delay after an unavailable probe once settled (default 5 s).
    #[serde(default = "default_unavailable_retry_ms")]
    pub unavailable_retry_ms: u64,
    /// Delay after an available probe (default 10 s).
    #[serde(default = "default_available_retry_ms")]
    pub available_retry_ms: u64,
    /// Permission poll interval (default 10 s).
    #[serde(default = "default_permission_poll_ms")]
    pub permission_poll_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    500
}
fn default_settling_attempts() -> u32 {
    5
}
fn default_unavailable_retry_ms() -> u64 {
    5_000
}
fn default_available_retry_ms() -> u64 {
    10_000
}
fn default_permission_poll_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            settling_attempts: default_settling_attempts(),
            unavailable_retry_ms: default_unavailable_retry_ms(),
            available_retry_ms: default_available_retry_ms(),
            permission_poll_ms: default_permission_poll_ms(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn availability_schedule(&self) -> AvailabilitySchedule {
        AvailabilitySchedule::new(
            self.settling_attempts,
            Duration::from_millis(self.unavailable_retry_ms),
            Duration::from_millis(self.available_retry_ms),
        )
    }

    pub fn permission_schedule(&self) -> FixedSchedule {
        FixedSchedule {
            interval: Duration::from_millis(self.permission_poll_ms),
        }
    }
}

/// Config text could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
