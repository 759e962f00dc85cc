//! # Pipeline
//!
//! The central coordinator. It owns one instance of every stage and wires
//! them in the order data flows:
//!
//! ```text
//! wire callback -> IngestBuffer (always)
//!               -> intake channel -> Processor -> Dispatcher -> handlers
//!                                                               -> PersistenceEngine -> store
//! ```
//!
//! Collaborators (the wire client, a dashboard, a CLI) talk to the pipeline
//! only: they feed messages through [`Pipeline::on_message`], register their
//! own handlers, and pull statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::configs::config_pipeline::PipelineConfig;
use crate::core::dispatcher::{DispatchStats, Dispatcher};
use crate::core::ingest_buffer::{BufferSnapshot, IngestBuffer, RawMessage};
use crate::core::processor::{Processor, ProcessorStats};
use crate::core::registry::{Category, Handler, HandlerId, HandlerPattern};
use crate::domain::integration::{DomainIntegration, IntegrationStats};
use crate::persistence::engine::{BatchStore, PersistenceEngine};
use crate::persistence::operation::Operation;
use crate::persistence::queue::PersistenceStats;

/// Statistics of every stage, pulled in one call.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Seconds since the pipeline started. Zero when never started.
    pub uptime_secs: u64,
    /// Ingest buffer.
    pub buffer: BufferSnapshot,
    /// Processing worker and intake channel.
    pub processing: ProcessorStats,
    /// Dispatcher.
    pub dispatch: DispatchStats,
    /// Domain integration.
    pub domain: IntegrationStats,
    /// Persistence engine.
    pub persistence: PersistenceStats,
}

/// # Ingest Pipeline
pub struct Pipeline {
    config: PipelineConfig,
    buffer: IngestBuffer,
    dispatcher: Arc<Dispatcher>,
    processor: Processor,
    engine: Arc<PersistenceEngine>,
    integration: Arc<DomainIntegration>,
    started_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl Pipeline {
    /// Builds every stage and registers the domain handlers. Nothing runs
    /// until [`Pipeline::start`].
    pub fn new(config: PipelineConfig, store: Arc<dyn BatchStore>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let engine = Arc::new(PersistenceEngine::new(config.database.clone(), store));
        let integration = Arc::new(DomainIntegration::new(Arc::clone(&engine), &config.alerts));
        integration.register(&dispatcher);

        Self {
            buffer: IngestBuffer::new(config.buffer.capacity),
            processor: Processor::new(
                Arc::clone(&dispatcher),
                config.buffer.intake_capacity,
                config.buffer.poll_timeout(),
            ),
            dispatcher,
            engine,
            integration,
            started_at: std::sync::Mutex::new(None),
            config,
        }
    }

    /// Starts persistence first, then processing, so the first dispatched
    /// message already has somewhere to go. Must be called inside a tokio
    /// runtime.
    pub fn start(&self) -> bool {
        let engine_started = self.engine.start();
        let processor_started = self.processor.start();
        if engine_started || processor_started {
            let mut started_at = self
                .started_at
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            started_at.get_or_insert_with(Utc::now);
            log::info!("Telemetry pipeline started");
        }
        engine_started && processor_started
    }

    /// # Stop
    ///
    /// Stops intake, gives the persistence queue up to `shutdown_timeout` to
    /// empty, then stops persistence (which writes anything left as a final
    /// batch).
    pub async fn stop(&self) {
        self.processor.stop().await;
        let timeout = self.config.database.shutdown_timeout();
        if !self.engine.wait_for_queue_empty(timeout).await {
            log::warn!("Some database operations may not have completed");
        }
        self.engine.stop().await;
        log::info!("Telemetry pipeline stopped");
    }

    /// # Wire Callback
    ///
    /// Records the message in the ingest buffer and offers it to the
    /// processing worker. Never blocks. Returns false when the message was
    /// only buffered.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> bool {
        self.ingest(Arc::new(RawMessage::from_bytes(topic, payload)))
    }

    /// Same as [`Pipeline::on_message`] for an already built message.
    pub fn ingest(&self, message: Arc<RawMessage>) -> bool {
        self.buffer.record(Arc::clone(&message));
        self.processor.submit(message)
    }

    /// Registers a collaborator handler.
    pub fn register_handler(
        &self,
        category: Category,
        pattern: HandlerPattern,
        handler: Handler,
    ) -> HandlerId {
        self.dispatcher.register(category, pattern, handler)
    }

    /// Removes one (`Some(id)`) or all (`None`) handlers under a pattern.
    pub fn unregister_handler(
        &self,
        category: Category,
        pattern: &HandlerPattern,
        id: Option<HandlerId>,
    ) -> usize {
        self.dispatcher.unregister_pattern(category, pattern, id)
    }

    /// Queues a persistence operation directly.
    pub fn enqueue_operation(&self, operation: Operation) -> bool {
        self.engine.enqueue(operation)
    }

    /// Waits until the persistence queue and worker are idle.
    pub async fn wait_for_queue_empty(&self, timeout: Duration) -> bool {
        self.engine.wait_for_queue_empty(timeout).await
    }

    /// Up to `n` most recent raw messages, newest first.
    pub fn recent_messages(&self, n: usize) -> std::vec::IntoIter<Arc<RawMessage>> {
        self.buffer.recent(n)
    }

    /// Statistics of every stage.
    pub fn stats(&self) -> PipelineStats {
        let uptime_secs = self
            .started_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .map_or(0, |t| (Utc::now() - t).num_seconds().max(0) as u64);
        PipelineStats {
            uptime_secs,
            buffer: self.buffer.snapshot(),
            processing: self.processor.stats(),
            dispatch: self.dispatcher.stats(),
            domain: self.integration.stats(),
            persistence: self.engine.stats(),
        }
    }

    /// # Health Check
    ///
    /// Human-readable warnings about degradation: a persistence queue above
    /// the configured fill ratio, ingest buffer overflows, intake drops,
    /// failed batches.
    pub fn health_warnings(&self) -> Vec<String> {
        health_warnings(&self.stats(), self.config.monitoring.queue_warning_ratio)
    }

    /// The ingest buffer.
    pub fn buffer(&self) -> &IngestBuffer {
        &self.buffer
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The persistence engine.
    pub fn engine(&self) -> &Arc<PersistenceEngine> {
        &self.engine
    }

    /// The domain integration.
    pub fn integration(&self) -> &Arc<DomainIntegration> {
        &self.integration
    }

    /// The configuration the pipeline was built with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

/// Warnings derived from a statistics snapshot.
pub fn health_warnings(stats: &PipelineStats, queue_warning_ratio: f64) -> Vec<String> {
    let mut warnings = Vec::new();
    let p = &stats.persistence;
    if p.queue_capacity > 0 {
        let usage = p.queue_size as f64 / p.queue_capacity as f64;
        if usage > queue_warning_ratio {
            warnings.push(format!("Database queue is {:.1}% full", usage * 100.0));
        }
    }
    if stats.buffer.overflow_count > 0 {
        warnings.push(format!(
            "Ingest buffer has {} overflows",
            stats.buffer.overflow_count
        ));
    }
    if stats.processing.intake_dropped > 0 {
        warnings.push(format!(
            "Intake queue dropped {} messages",
            stats.processing.intake_dropped
        ));
    }
    if p.errors > 0 {
        warnings.push(format!("{} database batches failed", p.errors));
    }
    warnings
}
