//! # Batched Persistence Engine
//!
//! Decouples producers from storage latency. Producers call
//! [`PersistenceEngine::enqueue`], which never blocks; one background task
//! collects operations into batches and hands each batch to a [`BatchStore`]
//! on the blocking pool.
//!
//! ## Key Features:
//! - **Backpressure**: the queue is bounded. A full queue rejects the
//!   operation and counts an overflow.
//! - **Flush policy**: a batch is written when it reaches `batch_size`, when a
//!   wait for the next operation times out with work pending, or when
//!   `max_batch_age` has passed since the last flush.
//! - **At-most-once**: a failed batch is audited, counted and discarded. It is
//!   never retried.
//! - **Graceful stop**: the worker drains everything still queued into one
//!   final batch before it exits.

use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::configs::config_pipeline::DatabaseConfig;
use crate::domain::thresholds::AlertLevel;
use crate::persistence::operation::{
    Batch, BatchAuditRecord, DeviceUpdate, EmergencyEvent, Operation, QueuedOperation,
    SensorReading, SystemAlert,
};
use crate::persistence::queue::{EngineState, OperationQueue, PersistenceStats, Rejection};

/// # Batch Store
///
/// Durable backend written by the batch worker. Both methods run on the
/// blocking thread pool.
pub trait BatchStore: Send + Sync + 'static {
    /// Applies every operation of `batch` atomically: all of them or none.
    fn write_batch(&self, batch: &Batch) -> anyhow::Result<()>;

    /// Appends one audit row describing a batch attempt.
    fn record_audit(&self, record: &BatchAuditRecord) -> anyhow::Result<()>;
}

/// When a pending batch is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Size trigger.
    pub batch_size: usize,
    /// Age trigger, measured from the previous flush.
    pub max_batch_age: Duration,
}

impl FlushPolicy {
    /// Policy from the database section of the configuration.
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_batch_age: config.max_batch_age(),
        }
    }

    /// Whether `pending` operations should be written now.
    pub fn should_flush(&self, pending: usize, timed_out: bool, since_last_flush: Duration) -> bool {
        pending > 0
            && (pending >= self.batch_size || timed_out || since_last_flush >= self.max_batch_age)
    }
}

/// Queue, worker and store of the persistence stage.
pub struct PersistenceEngine {
    config: DatabaseConfig,
    policy: FlushPolicy,
    queue: Arc<OperationQueue>,
    store: Arc<dyn BatchStore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceEngine {
    /// Stopped engine writing to `store`.
    pub fn new(config: DatabaseConfig, store: Arc<dyn BatchStore>) -> Self {
        Self {
            policy: FlushPolicy::from_config(&config),
            queue: Arc::new(OperationQueue::new(config.max_queue_size)),
            config,
            store,
            worker: Mutex::new(None),
        }
    }

    /// # Start
    ///
    /// `Stopped → Running` and spawns the batch worker. Must be called inside
    /// a tokio runtime. Returns false when the engine was not stopped.
    pub fn start(&self) -> bool {
        if !self.queue.transition(EngineState::Stopped, EngineState::Running) {
            log::warn!("Persistence engine already started ({:?})", self.queue.state());
            return false;
        }
        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            self.policy,
            self.config.poll_timeout(),
        ));
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        log::info!(
            "Persistence engine started (batch size {}, queue capacity {})",
            self.policy.batch_size,
            self.queue.capacity()
        );
        true
    }

    /// # Stop
    ///
    /// `Running → Stopping`, then joins the worker for at most
    /// `shutdown_timeout`. The worker writes whatever is left as a final batch
    /// and moves the engine to `Stopped` once it has exited.
    ///
    /// When the join times out the engine stays `Stopping`: [`Self::start`]
    /// refuses until the worker is gone, and calling `stop` again resumes the
    /// join.
    pub async fn stop(&self) {
        if !self.queue.transition(EngineState::Running, EngineState::Stopping)
            && self.queue.state() != EngineState::Stopping
        {
            return;
        }
        // Only the caller holding the handle may settle the state; a
        // concurrent `stop` without it leaves that to the worker.
        let Some(mut handle) = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return;
        };
        match tokio::time::timeout(self.config.shutdown_timeout(), &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Batch worker terminated abnormally: {}", e),
            Err(_) => {
                log::warn!(
                    "Batch worker still writing after {:?}, engine stays stopping until it exits",
                    self.config.shutdown_timeout()
                );
                let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(handle);
                }
                return;
            }
        }
        // A worker that panicked never reached its own transition.
        self.queue.transition(EngineState::Stopping, EngineState::Stopped);
        log::info!("Persistence engine stopped");
    }

    /// Queues an operation without blocking. False means it was dropped.
    pub fn enqueue(&self, operation: Operation) -> bool {
        let kind = operation.kind();
        match self.queue.push(operation) {
            Ok(()) => true,
            Err(Rejection::Full) => {
                log::warn!(
                    "Persistence queue full ({}), dropping {} operation",
                    self.queue.capacity(),
                    kind
                );
                false
            }
            Err(Rejection::NotRunning) => {
                log::debug!("Persistence engine not running, dropping {} operation", kind);
                false
            }
        }
    }

    /// Queues a presence update for `device_id`.
    pub fn update_device_status(
        &self,
        device_id: &str,
        status: &str,
        firmware_version: Option<String>,
        battery_level: Option<f64>,
    ) -> bool {
        self.enqueue(Operation::UpdateDevice(DeviceUpdate {
            device_id: device_id.to_string(),
            status: status.to_string(),
            firmware_version,
            battery_level,
            seen_at: Utc::now(),
        }))
    }

    /// Queues a sensor reading.
    pub fn insert_sensor_data(
        &self,
        device_id: &str,
        sensor_type: &str,
        value: Value,
        raw_message: Option<String>,
    ) -> bool {
        self.enqueue(Operation::InsertSensorData(SensorReading {
            device_id: device_id.to_string(),
            sensor_type: sensor_type.to_string(),
            value,
            raw_message,
            timestamp: Utc::now(),
        }))
    }

    /// Queues the start of an emergency.
    pub fn record_emergency_event(
        &self,
        device_id: &str,
        emergency_type: &str,
        location_data: Option<Value>,
        sensor_context: Option<Value>,
    ) -> bool {
        self.enqueue(Operation::EmergencyEvent(EmergencyEvent {
            device_id: device_id.to_string(),
            emergency_type: emergency_type.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: "active".to_string(),
            location_data,
            sensor_context,
        }))
    }

    /// Queues an alert.
    pub fn create_system_alert(
        &self,
        device_id: &str,
        alert_type: &str,
        alert_level: AlertLevel,
        message: &str,
        sensor_data: Option<Value>,
    ) -> bool {
        self.enqueue(Operation::SystemAlert(SystemAlert {
            device_id: device_id.to_string(),
            alert_type: alert_type.to_string(),
            alert_level,
            message: message.to_string(),
            sensor_data,
            timestamp: Utc::now(),
            acknowledged: false,
        }))
    }

    /// Waits until nothing is queued or pending in the worker.
    pub async fn wait_for_queue_empty(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout).await
    }

    /// Consistent counter snapshot.
    pub fn stats(&self) -> PersistenceStats {
        self.queue.stats()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.queue.state()
    }

    /// Whether the engine accepts work.
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }
}

async fn run_worker(
    queue: Arc<OperationQueue>,
    store: Arc<dyn BatchStore>,
    policy: FlushPolicy,
    poll_timeout: Duration,
) {
    let mut pending: Vec<QueuedOperation> = Vec::with_capacity(policy.batch_size);
    let mut last_flush = Instant::now();

    while queue.state() == EngineState::Running {
        let wait = if pending.is_empty() {
            poll_timeout
        } else {
            poll_timeout.min(policy.max_batch_age.saturating_sub(last_flush.elapsed()))
        };
        let timed_out = match queue.next(wait).await {
            Some(op) => {
                pending.push(op);
                false
            }
            None => true,
        };
        if policy.should_flush(pending.len(), timed_out, last_flush.elapsed()) {
            flush(&queue, &store, std::mem::take(&mut pending)).await;
            last_flush = Instant::now();
        }
    }

    pending.extend(queue.drain_all());
    if !pending.is_empty() {
        log::info!("Writing final batch of {} operation(s)", pending.len());
        flush(&queue, &store, pending).await;
    }
    queue.transition(EngineState::Stopping, EngineState::Stopped);
    log::debug!("Batch worker exited");
}

async fn flush(queue: &OperationQueue, store: &Arc<dyn BatchStore>, operations: Vec<QueuedOperation>) {
    let count = operations.len();
    let store = Arc::clone(store);
    let outcome = tokio::task::spawn_blocking(move || {
        let batch = Batch::new(operations);
        let started = std::time::Instant::now();
        let result = store.write_batch(&batch);
        let error = result.err().map(|e| format!("{:#}", e));
        let audit = BatchAuditRecord::batch_process(batch.len(), started.elapsed(), error);
        if let Err(e) = store.record_audit(&audit) {
            log::warn!("Failed to record batch audit: {:#}", e);
        }
        audit
    })
    .await;

    let success = match outcome {
        Ok(audit) if audit.success => {
            log::debug!("Committed batch of {} in {:?}", count, audit.duration);
            true
        }
        Ok(audit) => {
            log::error!(
                "Batch of {} operation(s) failed and was dropped: {}",
                count,
                audit.error_message.as_deref().unwrap_or("unknown error")
            );
            false
        }
        Err(e) => {
            log::error!("Batch writer task failed, {} operation(s) dropped: {}", count, e);
            false
        }
    };
    queue.finish_batch(count, success);
}
