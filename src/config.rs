//! Configuration for the HRM logger.

use crate::pipeline::PipelineConfig;
use crate::retry::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default ingestion endpoint of the sensor bridge.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws/ingest";

/// Main configuration for the logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket endpoint delivering sensor frames
    pub ws_url: String,

    /// SQLite database file
    pub db_path: PathBuf,

    /// Samples buffered per session before a batch write
    pub buffer_size: usize,

    /// Inactivity gap that closes a session (in seconds)
    pub gap_seconds: u64,

    /// Interval of the maintenance loop
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Width of aggregate buckets (in seconds)
    pub aggregate_interval_secs: u32,

    /// Log a status line every N records
    pub status_every: u64,

    /// Retry policy for batch writes
    pub storage_retry: RetryPolicy,

    /// Reconnect backoff for the ingestion connection
    pub reconnect: Backoff,

    /// Path for persisted counters
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hrm-logger");

        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            db_path: data_dir.join("hrm_data.db"),
            buffer_size: 30,
            gap_seconds: 300, // 5 minutes
            tick_interval: Duration::from_secs(30),
            aggregate_interval_secs: 30,
            status_every: 50,
            storage_retry: RetryPolicy::default(),
            reconnect: Backoff::reconnect(),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
            let config: Config =
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let config_path = Self::config_path();
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    /// Write configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hrm-logger")
            .join("config.json")
    }

    /// File holding the persisted ingest counters.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("ingest_stats.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.ws_url.trim();
        if url.is_empty() {
            return Err(ConfigError::Invalid(
                "ingestion endpoint (ws_url) is required".to_string(),
            ));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "ingestion endpoint must be a ws:// or wss:// URL, got `{url}`"
            )));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("db_path is required".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1".to_string()));
        }
        if self.gap_seconds == 0 {
            return Err(ConfigError::Invalid("gap_seconds must be at least 1".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "tick interval must be at least 1 second".to_string(),
            ));
        }
        if self.aggregate_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "aggregate interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    /// Pipeline tunables derived from this configuration.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            buffer_size: self.buffer_size,
            gap_seconds: self.gap_seconds as f64,
            tick_interval: self.tick_interval,
            aggregate_interval: self.aggregate_interval_secs,
            status_every: self.status_every,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
