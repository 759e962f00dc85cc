use lib_telemetry::persistence::{Batch, BatchAuditRecord, DeviceUpdate};
use lib_telemetry::{BatchStore, DatabaseConfig, EngineState, Operation, PersistenceEngine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Records batch sizes and audit rows, optionally failing every write.
#[derive(Default)]
struct RecordingStore {
    fail: bool,
    attempts: Mutex<Vec<usize>>,
    audits: Mutex<Vec<BatchAuditRecord>>,
}

impl BatchStore for RecordingStore {
    fn write_batch(&self, batch: &Batch) -> anyhow::Result<()> {
        self.attempts.lock().unwrap().push(batch.len());
        if self.fail {
            anyhow::bail!("database is locked");
        }
        Ok(())
    }

    fn record_audit(&self, record: &BatchAuditRecord) -> anyhow::Result<()> {
        self.audits.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Signals when a write starts and holds it until the gate is released.
struct GatedStore {
    entered: Mutex<mpsc::Sender<()>>,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl BatchStore for GatedStore {
    fn write_batch(&self, _batch: &Batch) -> anyhow::Result<()> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.gate.lock().unwrap().recv();
        Ok(())
    }

    fn record_audit(&self, _record: &BatchAuditRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Takes `delay` per write and tracks how many writes overlap.
struct SlowStore {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    written: AtomicUsize,
}

impl SlowStore {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
        }
    }
}

impl BatchStore for SlowStore {
    fn write_batch(&self, batch: &Batch) -> anyhow::Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.written.fetch_add(batch.len(), Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn record_audit(&self, _record: &BatchAuditRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

fn config(batch_size: usize, poll_ms: u64, age_ms: u64) -> DatabaseConfig {
    DatabaseConfig {
        batch_size,
        poll_timeout_ms: poll_ms,
        max_batch_age_ms: age_ms,
        shutdown_timeout_secs: 5,
        ..DatabaseConfig::default()
    }
}

fn presence(n: usize) -> Operation {
    Operation::UpdateDevice(DeviceUpdate {
        device_id: format!("helmet_{n:02}"),
        status: "online".into(),
        firmware_version: None,
        battery_level: None,
        seen_at: chrono::Utc::now(),
    })
}

async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_batch_size_triggers_exactly_one_flush() {
    let store = Arc::new(RecordingStore::default());
    let engine = PersistenceEngine::new(config(3, 60_000, 60_000), store.clone());
    assert!(engine.start());

    assert!(engine.enqueue(presence(1)));
    assert!(engine.enqueue(presence(2)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.stats().batch_inserts, 0);

    assert!(engine.enqueue(presence(3)));
    assert!(eventually(Duration::from_secs(3), || engine.stats().batch_inserts == 1).await);

    let stats = engine.stats();
    assert_eq!(stats.operations_completed, 3);
    assert_eq!(stats.operations_queued, 3);
    assert_eq!(*store.attempts.lock().unwrap(), vec![3]);
    engine.stop().await;
    assert_eq!(engine.stats().batch_inserts, 1);
}

#[tokio::test]
async fn test_batch_age_flushes_a_trickle() {
    let store = Arc::new(RecordingStore::default());
    let engine = PersistenceEngine::new(config(10, 60_000, 500), store.clone());
    engine.start();

    engine.enqueue(presence(1));
    engine.enqueue(presence(2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.stats().batch_inserts, 0);

    assert!(eventually(Duration::from_secs(3), || engine.stats().batch_inserts == 1).await);
    assert_eq!(*store.attempts.lock().unwrap(), vec![2]);
    assert_eq!(engine.stats().operations_completed, 2);
    engine.stop().await;
}

#[tokio::test]
async fn test_default_batch_age_flushes_after_five_seconds() {
    let store = Arc::new(RecordingStore::default());
    let engine = PersistenceEngine::new(config(10, 60_000, 5_000), store.clone());
    engine.start();
    let started = Instant::now();

    engine.enqueue(presence(1));
    engine.enqueue(presence(2));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(engine.stats().batch_inserts, 0);

    assert!(eventually(Duration::from_secs(8), || engine.stats().batch_inserts == 1).await);
    assert!(started.elapsed() >= Duration::from_millis(4_900));
    assert_eq!(*store.attempts.lock().unwrap(), vec![2]);
    engine.stop().await;
}

#[tokio::test]
async fn test_poll_timeout_flushes_pending_work() {
    let store = Arc::new(RecordingStore::default());
    let engine = PersistenceEngine::new(config(10, 50, 60_000), store.clone());
    engine.start();

    engine.enqueue(presence(1));
    assert!(engine.wait_for_queue_empty(Duration::from_secs(3)).await);
    assert_eq!(*store.attempts.lock().unwrap(), vec![1]);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_rejects_without_blocking() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let store = Arc::new(GatedStore {
        entered: Mutex::new(entered_tx),
        gate: Mutex::new(release_rx),
    });
    let mut cfg = config(1, 50, 60_000);
    cfg.max_queue_size = 2;
    let engine = PersistenceEngine::new(cfg, store);
    engine.start();

    // The first operation occupies the worker inside the store.
    assert!(engine.enqueue(presence(0)));
    tokio::task::spawn_blocking(move || entered_rx.recv().unwrap())
        .await
        .unwrap();

    assert!(engine.enqueue(presence(1)));
    assert!(engine.enqueue(presence(2)));
    let started = Instant::now();
    assert!(!engine.enqueue(presence(3)));
    assert!(started.elapsed() < Duration::from_millis(100));

    let stats = engine.stats();
    assert_eq!(stats.queue_overflows, 1);
    assert_eq!(stats.queue_size, 2);
    assert_eq!(stats.queue_capacity, 2);

    drop(release_tx);
    assert!(engine.wait_for_queue_empty(Duration::from_secs(3)).await);
    let stats = engine.stats();
    assert_eq!(stats.operations_completed, 3);
    assert_eq!(stats.operations_queued, 3);
    engine.stop().await;
}

#[tokio::test]
async fn test_failed_batch_is_audited_and_not_retried() {
    let store = Arc::new(RecordingStore {
        fail: true,
        ..RecordingStore::default()
    });
    let engine = PersistenceEngine::new(config(3, 50, 60_000), store.clone());
    engine.start();

    for n in 0..3 {
        assert!(engine.enqueue(presence(n)));
    }
    assert!(engine.wait_for_queue_empty(Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = engine.stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.operations_completed, 0);
    assert_eq!(stats.batch_inserts, 0);
    assert_eq!(*store.attempts.lock().unwrap(), vec![3]);

    let audits = store.audits.lock().unwrap().clone();
    assert_eq!(audits.len(), 1);
    assert!(!audits[0].success);
    assert_eq!(audits[0].items_count, 3);
    assert_eq!(audits[0].operation_type, "batch_process");
    assert!(audits[0].error_message.as_deref().unwrap().contains("locked"));

    // Ingestion keeps going after a storage failure.
    assert!(engine.enqueue(presence(9)));
    engine.stop().await;
}

#[tokio::test]
async fn test_stop_writes_remaining_operations_as_final_batch() {
    let store = Arc::new(RecordingStore::default());
    let engine = PersistenceEngine::new(config(100, 60_000, 60_000), store.clone());
    engine.start();

    for n in 0..5 {
        engine.enqueue(presence(n));
    }
    engine.stop().await;

    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(*store.attempts.lock().unwrap(), vec![5]);
    let stats = engine.stats();
    assert_eq!(stats.operations_completed, 5);
    assert_eq!(stats.queue_size, 0);
    assert!(!stats.is_running);
    assert!(!engine.enqueue(presence(6)));
}

#[tokio::test]
async fn test_lifecycle_guards() {
    let store = Arc::new(RecordingStore::default());
    let engine = PersistenceEngine::new(config(5, 50, 60_000), store);

    assert!(!engine.enqueue(presence(0)));
    assert_eq!(engine.stats().queue_overflows, 0);
    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Stopped);

    assert!(engine.start());
    assert!(!engine.start());
    assert!(engine.is_running());
    engine.stop().await;
    assert!(engine.start());
    engine.stop().await;
}

#[tokio::test]
async fn test_stop_timeout_keeps_engine_stopping_until_worker_exits() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(1_500)));
    let mut cfg = config(100, 60_000, 60_000);
    cfg.shutdown_timeout_secs = 1;
    let engine = PersistenceEngine::new(cfg, store.clone());
    engine.start();
    assert!(engine.enqueue(presence(1)));

    // The final batch outlives the shutdown timeout.
    let started = Instant::now();
    engine.stop().await;
    assert!(started.elapsed() < Duration::from_millis(1_400));
    assert_eq!(engine.state(), EngineState::Stopping);
    assert!(!engine.start());
    assert!(!engine.enqueue(presence(2)));

    // A second stop finishes the join.
    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(store.written.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats().operations_completed, 1);

    assert!(engine.start());
    assert!(engine.enqueue(presence(3)));
    engine.stop().await;
    assert!(eventually(Duration::from_secs(3), || engine.state() == EngineState::Stopped).await);
    assert_eq!(store.written.load(Ordering::SeqCst), 2);
    assert_eq!(store.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_abandoned_worker_finishes_into_stopped_state() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(1_300)));
    let mut cfg = config(100, 60_000, 60_000);
    cfg.shutdown_timeout_secs = 1;
    let engine = PersistenceEngine::new(cfg, store.clone());
    engine.start();
    engine.enqueue(presence(1));

    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Stopping);
    assert!(eventually(Duration::from_secs(3), || engine.state() == EngineState::Stopped).await);
    assert_eq!(store.written.load(Ordering::SeqCst), 1);

    assert!(engine.start());
    engine.stop().await;
    assert_eq!(store.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_idle_engine_flushes_first_operation_after_batch_age() {
    let store = Arc::new(RecordingStore::default());
    let engine = PersistenceEngine::new(config(10, 60_000, 200), store.clone());
    engine.start();

    // Idle for longer than the batch age, then a single operation arrives.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let enqueued = Instant::now();
    assert!(engine.enqueue(presence(1)));
    assert!(eventually(Duration::from_secs(2), || engine.stats().batch_inserts == 1).await);
    assert!(enqueued.elapsed() < Duration::from_millis(150));
    assert_eq!(*store.attempts.lock().unwrap(), vec![1]);
    engine.stop().await;
}

#[tokio::test]
async fn test_concurrent_stop_leaves_live_worker_stopping() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(600)));
    let mut cfg = config(100, 60_000, 60_000);
    cfg.shutdown_timeout_secs = 5;
    let engine = PersistenceEngine::new(cfg, store.clone());
    engine.start();
    assert!(engine.enqueue(presence(1)));

    // The second caller finds the handle already taken by the first.
    let (_, (state, written)) = tokio::join!(engine.stop(), async {
        engine.stop().await;
        (engine.state(), store.written.load(Ordering::SeqCst))
    });
    assert_eq!(state, EngineState::Stopping);
    assert_eq!(written, 0);

    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(store.written.load(Ordering::SeqCst), 1);
    assert!(engine.start());
    engine.stop().await;
    assert_eq!(store.max_active.load(Ordering::SeqCst), 1);
}
