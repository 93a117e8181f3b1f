use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{ChainError, Result};

/// Engine configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Worker pool configuration
    /// Number of chains executed in parallel
    pub max_concurrency: usize,

    // Monitor configuration
    /// Interval between monitor sweeps
    #[serde(with = "duration_secs")]
    pub monitor_interval: Duration,
    /// Running chains older than this are cancelled by the monitor
    #[serde(with = "duration_secs")]
    pub execution_timeout: Duration,
    /// Completed chains kept in memory
    pub history_capacity: usize,
    /// Skip snapshot writes while the active set is unchanged
    pub snapshot_on_change_only: bool,
    /// How long `stop` waits for the monitor loop
    #[serde(with = "duration_secs")]
    pub stop_timeout: Duration,

    // Retry configuration
    /// Retries used when a definition does not set its own
    pub default_max_retries: u32,
    /// Backoff table used when a definition does not set its own
    #[serde(with = "duration_secs_vec")]
    pub default_backoff: Vec<Duration>,

    // Storage configuration
    /// Active-chain snapshot file
    pub snapshot_path: Option<PathBuf>,
    /// Durable history database directory
    pub history_path: Option<PathBuf>,

    /// Buffered lifecycle events per subscriber
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            monitor_interval: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(30 * 60),
            history_capacity: 1000,
            snapshot_on_change_only: false,
            stop_timeout: Duration::from_secs(5),
            default_max_retries: 3,
            default_backoff: crate::retry::DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            snapshot_path: None,
            history_path: None,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load configuration from a YAML file; missing keys take defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ChainError::configuration(
                "max_concurrency must be greater than 0",
            ));
        }
        if self.monitor_interval.is_zero() {
            return Err(ChainError::configuration(
                "monitor_interval must be greater than 0",
            ));
        }
        if self.execution_timeout < self.monitor_interval {
            return Err(ChainError::configuration(
                "execution_timeout should be greater than monitor_interval",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ChainError::configuration(
                "history_capacity must be greater than 0",
            ));
        }
        if self.default_backoff.is_empty() {
            return Err(ChainError::configuration(
                "default_backoff must contain at least one delay",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ChainError::configuration(
                "event_capacity must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Configuration for development and tests: short intervals, no files
    pub fn development() -> Self {
        Self {
            monitor_interval: Duration::from_secs(1),
            execution_timeout: Duration::from_secs(60),
            history_capacity: 100,
            stop_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn max_concurrency(mut self, workers: usize) -> Self {
        self.config.max_concurrency = workers;
        self
    }

    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor_interval = interval;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.config.execution_timeout = timeout;
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    pub fn snapshot_on_change_only(mut self, enabled: bool) -> Self {
        self.config.snapshot_on_change_only = enabled;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    /// Set default retry count and backoff table
    pub fn retries(mut self, max_retries: u32, backoff: Vec<Duration>) -> Self {
        self.config.default_max_retries = max_retries;
        self.config.default_backoff = backoff;
        self
    }

    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot_path = Some(path.into());
        self
    }

    pub fn history_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.history_path = Some(path.into());
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Durations are written as (fractional) seconds in config files
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod duration_secs_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs: Vec<f64> = value.iter().map(|d| d.as_secs_f64()).collect();
        secs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Vec::<f64>::deserialize(deserializer)?;
        secs.into_iter()
            .map(|s| {
                if !s.is_finite() || s < 0.0 {
                    Err(serde::de::Error::custom("backoff delays must be non-negative"))
                } else {
                    Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom)
                }
            })
            .collect()
    }
}
