use anyhow::{Context, Result};
use clap::Parser;
use lib_telemetry::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "server_ingest.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Helmet telemetry ingest server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "HELMET_CONFIG_PATH", help = "Path to the JSON server configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "HELMET_PIPELINE_CONFIG", help = "Path to the JSON pipeline configuration (buffer, database, alerts, monitoring).")]
    pub pipeline_config: Option<PathBuf>,

    #[clap(long, env = "HELMET_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "HELMET_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "HELMET_INPUT", help = "File of `topic payload` lines to ingest. Reads stdin when unset.")]
    pub input: Option<PathBuf>,

    #[clap(long, env = "HELMET_DB_PATH", help = "SQLite database file.")]
    pub db_path: Option<PathBuf>,

    #[clap(long, env = "HELMET_BATCH_SIZE", help = "Operations per database batch.")]
    pub batch_size: Option<usize>,

    #[clap(long, env = "HELMET_MAX_QUEUE_SIZE", help = "Capacity of the persistence queue.")]
    pub max_queue_size: Option<usize>,

    #[clap(long, env = "HELMET_BUFFER_CAPACITY", help = "Capacity of the recent-message ring buffer.")]
    pub buffer_capacity: Option<usize>,

    #[clap(long, env = "HELMET_STATS_INTERVAL_SECONDS", help = "Seconds between statistics reports.")]
    pub stats_interval_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            pipeline_config: other.pipeline_config.or(self.pipeline_config),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            input: other.input.or(self.input),
            db_path: other.db_path.or(self.db_path),
            batch_size: other.batch_size.or(self.batch_size),
            max_queue_size: other.max_queue_size.or(self.max_queue_size),
            buffer_capacity: other.buffer_capacity.or(self.buffer_capacity),
            stats_interval_seconds: other.stats_interval_seconds.or(self.stats_interval_seconds),
        }
    }

    fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    /// Builds the pipeline configuration: the pipeline file (or defaults)
    /// with the server-level overrides applied on top, then validated.
    pub fn pipeline(&self) -> Result<PipelineConfig> {
        let mut pipeline = match &self.pipeline_config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(db_path) = &self.db_path {
            pipeline.database.db_path = db_path.clone();
        }
        if let Some(batch_size) = self.batch_size {
            pipeline.database.batch_size = batch_size;
        }
        if let Some(max_queue_size) = self.max_queue_size {
            pipeline.database.max_queue_size = max_queue_size;
        }
        if let Some(capacity) = self.buffer_capacity {
            pipeline.buffer.capacity = capacity;
        }
        if let Some(interval) = self.stats_interval_seconds {
            pipeline.monitoring.stats_interval_secs = interval;
        }
        pipeline.validate().context("Invalid pipeline configuration")?;
        Ok(pipeline)
    }
}

fn read_file_config(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return None;
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&contents) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the JSON config file and CLI/env values, later layers
/// winning field by field.
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::defaults();
    if let Some(file_config) = read_file_config(&config_file_path) {
        current = current.merge(file_config);
    }
    current.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_ingest.conf");
        fs::write(&path, r#"{"logLevel": "debug", "batchSize": 40, "dbPath": "file.db"}"#).unwrap();

        let cli = Config {
            config_path: Some(path),
            batch_size: Some(5),
            ..Default::default()
        };
        let config = resolve(cli);

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.batch_size, Some(5));
        assert_eq!(config.db_path, Some(PathBuf::from("file.db")));
        assert_eq!(config.log_dir, Some(PathBuf::from("./logs")));
    }

    #[test]
    fn test_unparseable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "{ not json").unwrap();

        let config = resolve(Config {
            config_path: Some(path.clone()),
            ..Default::default()
        });
        assert_eq!(config.log_level.as_deref(), Some("info"));
        assert_eq!(config.config_path, Some(path));
    }

    #[test]
    fn test_pipeline_overrides_and_validation() {
        let config = Config {
            db_path: Some(PathBuf::from("override.db")),
            batch_size: Some(25),
            buffer_capacity: Some(64),
            stats_interval_seconds: Some(5),
            ..Default::default()
        };
        let pipeline = config.pipeline().unwrap();
        assert_eq!(pipeline.database.db_path, PathBuf::from("override.db"));
        assert_eq!(pipeline.database.batch_size, 25);
        assert_eq!(pipeline.buffer.capacity, 64);
        assert_eq!(pipeline.monitoring.stats_interval_secs, 5);

        let invalid = Config {
            batch_size: Some(0),
            ..Default::default()
        };
        assert!(invalid.pipeline().is_err());
    }
}
