//! # Persistence Operations
//!
//! The records Domain Integration produces and the batch worker writes. An
//! [`Operation`] carries its own payload, so its [`OperationKind`] can never
//! disagree with the data behind it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::domain::thresholds::AlertLevel;

/// Device presence update, upserted into `devices`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceUpdate {
    /// Unique device key.
    pub device_id: String,
    /// Presence status, `online` for any message received.
    pub status: String,
    /// Reported firmware version. Absent values keep the stored one.
    pub firmware_version: Option<String>,
    /// Reported battery level. Absent values keep the stored one.
    pub battery_level: Option<f64>,
    /// When the device was seen.
    pub seen_at: DateTime<Utc>,
}

/// One sensor sample, appended to `sensor_data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// Reporting device.
    pub device_id: String,
    /// Normalized sensor type (`gas`, `gps`, `temperature`, `pulse_oximeter`, ...).
    pub sensor_type: String,
    /// Parsed payload.
    pub value: Value,
    /// Original payload text.
    pub raw_message: Option<String>,
    /// Receive time of the originating message.
    pub timestamp: DateTime<Utc>,
}

/// Start of an emergency, appended to `emergency_events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyEvent {
    /// Device in emergency.
    pub device_id: String,
    /// What triggered it, e.g. `panic_button`.
    pub emergency_type: String,
    /// When the emergency started.
    pub start_time: DateTime<Utc>,
    /// When it was resolved. Always empty at creation.
    pub end_time: Option<DateTime<Utc>>,
    /// `active` at creation.
    pub status: String,
    /// Last known GPS fix of the device.
    pub location_data: Option<Value>,
    /// Payload that triggered the emergency.
    pub sensor_context: Option<Value>,
}

/// Alert derived from a threshold rule or a status message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemAlert {
    /// Device the alert concerns.
    pub device_id: String,
    /// Machine-readable alert type, e.g. `gas_alarm`.
    pub alert_type: String,
    /// Severity.
    pub alert_level: AlertLevel,
    /// Human-readable text.
    pub message: String,
    /// Payload the alert was derived from.
    pub sensor_data: Option<Value>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Always false at creation.
    pub acknowledged: bool,
}

/// A unit of work for the batch worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Operation {
    /// Upsert into `devices`.
    UpdateDevice(DeviceUpdate),
    /// Insert into `sensor_data`.
    InsertSensorData(SensorReading),
    /// Insert into `emergency_events`.
    EmergencyEvent(EmergencyEvent),
    /// Insert into `system_alerts`.
    SystemAlert(SystemAlert),
}

impl Operation {
    /// The kind this operation belongs to.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::UpdateDevice(_) => OperationKind::UpdateDevice,
            Operation::InsertSensorData(_) => OperationKind::InsertSensorData,
            Operation::EmergencyEvent(_) => OperationKind::EmergencyEvent,
            Operation::SystemAlert(_) => OperationKind::SystemAlert,
        }
    }

    /// Device the operation concerns.
    pub fn device_id(&self) -> &str {
        match self {
            Operation::UpdateDevice(op) => &op.device_id,
            Operation::InsertSensorData(op) => &op.device_id,
            Operation::EmergencyEvent(op) => &op.device_id,
            Operation::SystemAlert(op) => &op.device_id,
        }
    }
}

/// Discriminant of [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// `update_device`
    UpdateDevice,
    /// `insert_sensor_data`
    InsertSensorData,
    /// `emergency_event`
    EmergencyEvent,
    /// `system_alert`
    SystemAlert,
}

impl OperationKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::UpdateDevice => "update_device",
            OperationKind::InsertSensorData => "insert_sensor_data",
            OperationKind::EmergencyEvent => "emergency_event",
            OperationKind::SystemAlert => "system_alert",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation plus the time it entered the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedOperation {
    /// The work itself.
    pub operation: Operation,
    /// Enqueue time.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedOperation {
    /// Stamps `operation` with the current time.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            enqueued_at: Utc::now(),
        }
    }

    /// Shortcut for `self.operation.kind()`.
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}

/// Operations of one batch grouped by kind, each group in queue order.
#[derive(Debug, Default)]
pub struct Partitioned<'a> {
    /// `update_device` operations.
    pub devices: Vec<&'a DeviceUpdate>,
    /// `insert_sensor_data` operations.
    pub readings: Vec<&'a SensorReading>,
    /// `emergency_event` operations.
    pub emergencies: Vec<&'a EmergencyEvent>,
    /// `system_alert` operations.
    pub alerts: Vec<&'a SystemAlert>,
}

/// A group of operations written in one transaction.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    operations: Vec<QueuedOperation>,
}

impl Batch {
    /// Wraps queued operations.
    pub fn new(operations: Vec<QueuedOperation>) -> Self {
        Self { operations }
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True when the batch holds nothing.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations in queue order.
    pub fn operations(&self) -> &[QueuedOperation] {
        &self.operations
    }

    /// Splits the batch by kind.
    pub fn partition(&self) -> Partitioned<'_> {
        let mut parts = Partitioned::default();
        for queued in &self.operations {
            match &queued.operation {
                Operation::UpdateDevice(op) => parts.devices.push(op),
                Operation::InsertSensorData(op) => parts.readings.push(op),
                Operation::EmergencyEvent(op) => parts.emergencies.push(op),
                Operation::SystemAlert(op) => parts.alerts.push(op),
            }
        }
        parts
    }
}

/// Outcome of one batch attempt, appended to `buffer_audit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchAuditRecord {
    /// Always `batch_process` for worker flushes.
    pub operation_type: String,
    /// Operations in the batch.
    pub items_count: usize,
    /// Time spent writing the batch.
    pub duration: Duration,
    /// Whether the transaction committed.
    pub success: bool,
    /// Store error text for failed batches.
    pub error_message: Option<String>,
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
}

impl BatchAuditRecord {
    /// Audit row for a worker flush.
    pub fn batch_process(
        items_count: usize,
        duration: Duration,
        error_message: Option<String>,
    ) -> Self {
        Self {
            operation_type: "batch_process".to_string(),
            items_count,
            duration,
            success: error_message.is_none(),
            error_message,
            timestamp: Utc::now(),
        }
    }
}
