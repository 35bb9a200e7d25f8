use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GridError, Result};
use crate::eviction::EvictionPolicy;

pub const DEFAULT_BUCKET_SIZE: usize = 100;
pub const DEFAULT_DEBOUNCE_DELAY_MS: u64 = 500;
pub const DEFAULT_STALE_THRESHOLD_MS: u64 = 5_000;
pub const DEFAULT_SIMULATED_LATENCY_MS: u64 = 250;

/// Environment variable naming a JSON config file for [`GridConfig::load`].
pub const CONFIG_ENV_VAR: &str = "LAZYGRID_CONFIG";

/// Serializable form of an [`EvictionPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RetentionSetting {
    Never,
    #[default]
    Immediate,
    AfterMs(u64),
}

impl RetentionSetting {
    pub fn to_policy(self) -> EvictionPolicy {
        match self {
            RetentionSetting::Never => EvictionPolicy::Never,
            RetentionSetting::Immediate => EvictionPolicy::Immediate,
            RetentionSetting::AfterMs(ms) => EvictionPolicy::AfterDuration(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GridConfig {
    /// Number of row ids fetched per bucket.
    pub bucket_size: usize,
    /// Delay applied to every batch after the first one of a dataset.
    pub debounce_delay_ms: u64,
    /// Age after which a populated cell is re-fetched on the next `populate`.
    pub stale_threshold_ms: u64,
    pub prefetch_first_bucket: bool,
    /// Keep results for evicted cells so a re-created entry starts warm.
    pub hydrate_evicted_cells: bool,
    pub dataset_retention: RetentionSetting,
    pub cell_retention: RetentionSetting,

    pub simulated_latency_ms: u64,
    pub simulated_row_count: usize,
    pub simulated_column_count: usize,
    pub simulated_object_count: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            bucket_size: DEFAULT_BUCKET_SIZE,
            debounce_delay_ms: DEFAULT_DEBOUNCE_DELAY_MS,
            stale_threshold_ms: DEFAULT_STALE_THRESHOLD_MS,
            prefetch_first_bucket: true,
            hydrate_evicted_cells: false,
            dataset_retention: RetentionSetting::Immediate,
            cell_retention: RetentionSetting::Immediate,
            simulated_latency_ms: DEFAULT_SIMULATED_LATENCY_MS,
            simulated_row_count: 10_000,
            simulated_column_count: 30,
            simulated_object_count: 3,
        }
    }
}

impl GridConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: GridConfig = serde_json::from_str(json)
            .map_err(|e| GridError::InvariantViolation(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            GridError::InvariantViolation(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Reads the file named by `LAZYGRID_CONFIG`, falling back to defaults.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => {
                log::info!("loading grid config from {}", path);
                Self::from_file(path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_size == 0 {
            return Err(GridError::InvariantViolation(
                "bucket size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn simulated_latency(&self) -> Duration {
        Duration::from_millis(self.simulated_latency_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_grid_constants() {
        let config = GridConfig::default();
        assert_eq!(config.bucket_size, 100);
        assert_eq!(config.debounce_delay(), Duration::from_millis(500));
        assert_eq!(config.stale_threshold(), Duration::from_millis(5_000));
        assert_eq!(config.cell_retention, RetentionSetting::Immediate);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            GridConfig::from_json_str(r#"{"debounceDelayMs": 50, "cellRetention": {"afterMs": 1000}}"#)
                .unwrap();
        assert_eq!(config.debounce_delay_ms, 50);
        assert_eq!(config.bucket_size, 100);
        assert_eq!(config.cell_retention, RetentionSetting::AfterMs(1000));
        assert!(matches!(
            config.cell_retention.to_policy(),
            EvictionPolicy::AfterDuration(d) if d == Duration::from_secs(1)
        ));
    }

    #[test]
    fn zero_bucket_size_is_rejected() {
        let err = GridConfig::from_json_str(r#"{"bucketSize": 0}"#).unwrap_err();
        assert!(matches!(err, GridError::InvariantViolation(_)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(GridConfig::from_json_str("{ not json").is_err());
    }
}
