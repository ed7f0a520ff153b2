//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use tripsync_common::{Error, Result};

use crate::retry::RetryConfig;

/// Configuration for the sync coordinator and background scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Timer period while the app is visible.
    pub fast_interval_secs: u64,
    /// Timer period while the app is hidden.
    pub slow_interval_secs: u64,
    /// Maximum number of retries for hash and collection fetches.
    pub max_retries: u32,
    /// First retry delay, doubled on each attempt.
    pub retry_initial_delay_ms: u64,
    /// Cap for the retry delay.
    pub retry_max_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fast_interval_secs: 30,
            slow_interval_secs: 300,
            max_retries: 2,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 10_000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_json(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check that the intervals make sense.
    pub fn validate(&self) -> Result<()> {
        if self.fast_interval_secs == 0 || self.slow_interval_secs == 0 {
            return Err(Error::Config("Sync intervals must be positive".to_string()));
        }
        if self.fast_interval_secs > self.slow_interval_secs {
            return Err(Error::Config(
                "Fast interval must not exceed slow interval".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_secs(self.fast_interval_secs)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_secs(self.slow_interval_secs)
    }

    /// Retry policy for network fetches.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
    }
}
