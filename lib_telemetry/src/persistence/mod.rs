//! # Persistence
//!
//! Everything between a handler deciding something must be stored and the
//! store committing it: the operation records, the bounded queue and the
//! batch engine.

/// The batch worker, flush policy and `BatchStore` seam.
pub mod engine;
/// Operation records and batches.
pub mod operation;
/// Bounded queue, lifecycle state and counters.
pub mod queue;

pub use engine::{BatchStore, FlushPolicy, PersistenceEngine};
pub use operation::{
    Batch, BatchAuditRecord, DeviceUpdate, EmergencyEvent, Operation, OperationKind,
    QueuedOperation, SensorReading, SystemAlert,
};
pub use queue::{EngineState, PersistenceStats};
