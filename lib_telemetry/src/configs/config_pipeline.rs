//! # Pipeline Configuration
//!
//! Serde model for every tunable of the ingest pipeline. All sections are
//! optional in the JSON file; anything left out falls back to the defaults
//! below, which match the values the helmet deployment has been running with
//! (30 message buffer, batches of 15, a queue of 200 pending operations).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// The path that was being read.
        path: PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The file was read but is not a valid configuration document.
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        /// The path that was being parsed.
        path: PathBuf,
        /// The underlying JSON failure.
        #[source]
        source: serde_json::Error,
    },

    /// A value is syntactically fine but unusable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// # Pipeline Configuration
///
/// Top-level document. Each stage reads its own section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ingest buffer and intake queue sizing.
    pub buffer: BufferConfig,
    /// Persistence engine and store settings.
    pub database: DatabaseConfig,
    /// Thresholds used to derive alerts from sensor readings.
    pub alerts: AlertThresholds,
    /// Operator-facing reporting settings.
    pub monitoring: MonitoringConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            database: DatabaseConfig::default(),
            alerts: AlertThresholds::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads and validates a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would leave a stage unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.capacity == 0 {
            return Err(ConfigError::Invalid("buffer.capacity must be at least 1".into()));
        }
        if self.buffer.intake_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer.intake_capacity must be at least 1".into(),
            ));
        }
        if self.database.batch_size == 0 {
            return Err(ConfigError::Invalid("database.batch_size must be at least 1".into()));
        }
        if self.database.max_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "database.max_queue_size must be at least 1".into(),
            ));
        }
        if self.buffer.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "buffer.poll_timeout_ms must be at least 1".into(),
            ));
        }
        if self.database.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "database.poll_timeout_ms must be at least 1".into(),
            ));
        }
        let alerts = &self.alerts;
        if alerts.critical_temperature < alerts.high_temperature {
            return Err(ConfigError::Invalid(format!(
                "alerts.critical_temperature ({}) is below alerts.high_temperature ({})",
                alerts.critical_temperature, alerts.high_temperature
            )));
        }
        if alerts.low_heart_rate > alerts.high_heart_rate {
            return Err(ConfigError::Invalid(format!(
                "alerts.low_heart_rate ({}) is above alerts.high_heart_rate ({})",
                alerts.low_heart_rate, alerts.high_heart_rate
            )));
        }
        Ok(())
    }
}

/// Ingest buffer and intake queue sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of recent raw messages kept by the ingest buffer.
    pub capacity: usize,
    /// Bound of the queue between the wire callback and the processing worker.
    pub intake_capacity: usize,
    /// How long the processing worker waits for a message before re-checking
    /// its running flag.
    pub poll_timeout_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            intake_capacity: 60,
            poll_timeout_ms: 1000,
        }
    }
}

impl BufferConfig {
    /// The processing worker's poll timeout.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// # Database Configuration
///
/// Settings for the SQLite store and for the batch engine in front of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Operations per batch before a size-triggered flush.
    pub batch_size: usize,
    /// Bound of the operation queue. Enqueue is rejected beyond it.
    pub max_queue_size: usize,
    /// Switch the database to WAL journaling on open.
    pub wal_mode: bool,
    /// How long the batch worker waits for the next operation.
    pub poll_timeout_ms: u64,
    /// Maximum time pending operations may wait for a flush under a trickle.
    pub max_batch_age_ms: u64,
    /// Bound on joining the batch worker during shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("helmet_system.db"),
            batch_size: 15,
            max_queue_size: 200,
            wal_mode: true,
            poll_timeout_ms: 1000,
            max_batch_age_ms: 5000,
            shutdown_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    /// The batch worker's wait timeout.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// The age after which a pending batch is flushed regardless of size.
    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }

    /// The bounded join applied by `PersistenceEngine::stop`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// # Alert Thresholds
///
/// Both temperature cutoffs are explicit: readings above `high_temperature`
/// raise a warning, readings above `critical_temperature` raise a critical
/// alert instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Celsius. Warning above this value.
    pub high_temperature: f64,
    /// Celsius. Critical above this value.
    pub critical_temperature: f64,
    /// BPM. Warning below this value.
    pub low_heart_rate: f64,
    /// BPM. Warning above this value.
    pub high_heart_rate: f64,
    /// SpO2 percentage. Critical below this value.
    pub low_oxygen: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            high_temperature: 38.0,
            critical_temperature: 40.0,
            low_heart_rate: 50.0,
            high_heart_rate: 150.0,
            low_oxygen: 90.0,
        }
    }
}

/// Operator-facing reporting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Seconds between statistics reports.
    pub stats_interval_secs: u64,
    /// Fraction of the persistence queue above which a health warning fires.
    pub queue_warning_ratio: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 30,
            queue_warning_ratio: 0.8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = PipelineConfig::from_json("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.buffer.capacity, 30);
        assert_eq!(config.database.batch_size, 15);
        assert_eq!(config.database.max_queue_size, 200);
        assert_eq!(config.alerts.critical_temperature, 40.0);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = PipelineConfig::from_json(
            r#"{"database": {"batch_size": 3}, "alerts": {"low_oxygen": 92}}"#,
        )
        .unwrap();
        assert_eq!(config.database.batch_size, 3);
        assert_eq!(config.database.max_queue_size, 200);
        assert_eq!(config.alerts.low_oxygen, 92.0);
        assert_eq!(config.alerts.high_temperature, 38.0);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let err = PipelineConfig::from_json(r#"{"database": {"batch_size": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_poll_timeouts_are_rejected() {
        let err = PipelineConfig::from_json(r#"{"buffer": {"poll_timeout_ms": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("buffer.poll_timeout_ms"));
        let err =
            PipelineConfig::from_json(r#"{"database": {"poll_timeout_ms": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("database.poll_timeout_ms"));
        assert!(PipelineConfig::from_json(r#"{"database": {"poll_timeout_ms": 1}}"#).is_ok());
    }

    #[test]
    fn test_inverted_temperature_thresholds_are_rejected() {
        let err = PipelineConfig::from_json(
            r#"{"alerts": {"high_temperature": 41, "critical_temperature": 39}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("critical_temperature"));
    }

    #[test]
    fn test_from_file_reports_missing_path() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/pipeline.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
