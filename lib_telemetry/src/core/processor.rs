//! # Processing Worker
//!
//! The single consumer between the wire callback and the dispatcher. The wire
//! side only ever calls [`Processor::submit`], a non-blocking `try_send` into a
//! bounded channel; the worker task drains that channel and routes each
//! message synchronously.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::core::dispatcher::Dispatcher;
use crate::core::ingest_buffer::RawMessage;

/// Entry of the intake channel.
#[derive(Debug)]
pub enum IntakeItem {
    /// A message to route.
    Message(Arc<RawMessage>),
    /// Wakes the worker so it can observe shutdown.
    Shutdown,
}

/// Processing counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    /// Messages routed by the worker.
    pub messages_processed: u64,
    /// Messages rejected because the intake channel was full.
    pub intake_dropped: u64,
    /// Messages waiting in the intake channel.
    pub queue_size: usize,
    /// Bound of the intake channel.
    pub intake_capacity: usize,
    /// Whether the worker is running.
    pub is_running: bool,
}

/// Owns the intake channel and the worker task.
pub struct Processor {
    dispatcher: Arc<Dispatcher>,
    intake_capacity: usize,
    poll_timeout: Duration,
    sender: Mutex<Option<mpsc::Sender<IntakeItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    messages_processed: Arc<AtomicU64>,
    intake_dropped: AtomicU64,
}

impl Processor {
    /// Creates a stopped processor feeding `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>, intake_capacity: usize, poll_timeout: Duration) -> Self {
        Self {
            dispatcher,
            intake_capacity: intake_capacity.max(1),
            poll_timeout,
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            messages_processed: Arc::new(AtomicU64::new(0)),
            intake_dropped: AtomicU64::new(0),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<IntakeItem>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the worker task. Must be called inside a tokio runtime.
    /// Returns false when already running.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("Processing worker already running");
            return false;
        }
        let (tx, rx) = mpsc::channel(self.intake_capacity);
        *self.sender() = Some(tx);

        let handle = tokio::spawn(run_worker(
            rx,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.running),
            Arc::clone(&self.messages_processed),
            self.poll_timeout,
        ));
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        log::info!("Processing worker started (intake capacity {})", self.intake_capacity);
        true
    }

    /// Hands a message to the worker without blocking. Returns false when the
    /// message was not accepted.
    pub fn submit(&self, message: Arc<RawMessage>) -> bool {
        let sender = self.sender();
        let Some(tx) = sender.as_ref() else {
            log::debug!("Processing worker not running, {} kept in buffer only", message.topic);
            return false;
        };
        match tx.try_send(IntakeItem::Message(message)) {
            Ok(()) => true,
            Err(TrySendError::Full(IntakeItem::Message(m))) => {
                self.intake_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Intake queue full, dropping message on {}", m.topic);
                false
            }
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => {
                log::debug!("Intake queue closed");
                false
            }
        }
    }

    /// Signals the worker and waits for it to exit. Messages still queued in
    /// the intake channel are not processed.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.sender().take() {
            // Best effort: a full channel still wakes on the poll timeout.
            let _ = tx.try_send(IntakeItem::Shutdown);
        }
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Processing worker terminated abnormally: {}", e);
            }
        }
        log::info!("Processing worker stopped");
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current counters.
    pub fn stats(&self) -> ProcessorStats {
        let queue_size = self
            .sender()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity());
        ProcessorStats {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            intake_dropped: self.intake_dropped.load(Ordering::Relaxed),
            queue_size,
            intake_capacity: self.intake_capacity,
            is_running: self.is_running(),
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<IntakeItem>,
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    poll_timeout: Duration,
) {
    while running.load(Ordering::SeqCst) {
        match tokio::time::timeout(poll_timeout, rx.recv()).await {
            Ok(Some(IntakeItem::Message(message))) => {
                dispatcher.route(&message);
                processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(IntakeItem::Shutdown)) | Ok(None) => break,
            Err(_) => continue,
        }
    }
    log::debug!("Processing loop exited");
}
