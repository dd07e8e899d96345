//! Configuration for a stream

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Rate policy for incoming changes
    pub record_rate: RateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            record_rate: RateConfig::default(),
        }
    }
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.record_rate.validate()
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(ms) = std::env::var("STREAM_KEYFRAME_FREQUENCY_MS") {
            config.record_rate.keyframe_frequency_ms = ms
                .parse()
                .map_err(|e| Error::Config(format!("STREAM_KEYFRAME_FREQUENCY_MS: {}", e)))?;
        }

        if let Ok(ms) = std::env::var("STREAM_CHANGE_FREQUENCY_MS") {
            config.record_rate.change_frequency_ms = ms
                .parse()
                .map_err(|e| Error::Config(format!("STREAM_CHANGE_FREQUENCY_MS: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Write-rate policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Maximum time gap between consecutive snapshots (milliseconds).
    /// Bounds the worst-case replay distance for any read.
    pub keyframe_frequency_ms: u64,

    /// Minimum time gap between two distinct mutation entries
    /// (milliseconds). Writes arriving closer together are merged into the
    /// most recent mutation instead of creating a new entry.
    pub change_frequency_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            keyframe_frequency_ms: 60_000, // one keyframe per minute
            change_frequency_ms: 1_000,
        }
    }
}

impl RateConfig {
    /// Keyframe cadence as a duration.
    pub fn keyframe_frequency(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.keyframe_frequency_ms as i64)
    }

    /// Merge window as a duration.
    pub fn change_frequency(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.change_frequency_ms as i64)
    }

    /// Validate the rate policy. A zero keyframe cadence would disable
    /// snapshots entirely and make replays unbounded.
    pub fn validate(&self) -> Result<()> {
        if self.keyframe_frequency_ms == 0 {
            return Err(Error::Config(
                "keyframe_frequency_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
