//! # lib_telemetry
//!
//! The ingest side of the helmet monitoring system. Devices publish small
//! topic-addressed messages; this crate keeps a rolling window of what arrived,
//! routes each message to the handlers interested in it, and turns the results
//! into database writes that are grouped into batches on a background worker.
//!
//! ## Layout:
//! - **`core`**: the ingest buffer, the handler registry and dispatcher, the
//!   processing worker and the `Pipeline` that wires them together.
//! - **`persistence`**: queued operations, the bounded operation queue and the
//!   batch engine that flushes them to a `BatchStore`.
//! - **`connections`**: the SQLite implementation of `BatchStore`.
//! - **`domain`**: sensor payload parsing, threshold rules and the integration
//!   handlers that translate telemetry into persistence operations.
//! - **`configs`**: the serde configuration model and its JSON loader.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Configuration model and loaders.
pub mod configs;
/// Durable store implementations.
#[cfg(feature = "sqlite")]
pub mod connections;
/// Ingest buffer, dispatch and processing stages.
pub mod core;
/// Telemetry interpretation and alert derivation.
pub mod domain;
/// Batched, asynchronous persistence.
pub mod persistence;

// --- Public API Re-exports ---
pub use crate::configs::config_pipeline::{
    AlertThresholds, BufferConfig, ConfigError, DatabaseConfig, MonitoringConfig, PipelineConfig,
};
#[cfg(feature = "sqlite")]
pub use crate::connections::db_sqlite::{DbError, SqliteStore};
pub use crate::core::{
    BufferSnapshot, Category, DispatchStats, Dispatcher, Handler, HandlerId, HandlerPattern,
    IngestBuffer, Pipeline, PipelineStats, Processor, ProcessorStats, RawMessage, Topic,
};
pub use crate::domain::{AlertLevel, DomainIntegration, EmergencyState, IntegrationStats};
pub use crate::persistence::{
    BatchStore, EngineState, Operation, OperationKind, PersistenceEngine, PersistenceStats,
    QueuedOperation,
};
