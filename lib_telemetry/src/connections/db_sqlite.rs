//! # SQLite Store
//!
//! The durable backend of the persistence engine. One `rusqlite` connection
//! behind a mutex; only the batch worker writes, so there is no write
//! contention to manage.
//!
//! ## Schema
//!
//! ```sql
//! devices          (device_id PK, first_seen, last_seen, status,
//!                   firmware_version, last_battery_level, total_messages)
//! sensor_data      (id PK, device_id, sensor_type, value, raw_message, timestamp)
//! emergency_events (id PK, device_id, emergency_type, start_time, end_time,
//!                   status, location_data, sensor_context)
//! system_alerts    (id PK, device_id, alert_type, alert_level, message,
//!                   sensor_data, timestamp, acknowledged)
//! buffer_audit     (id PK, operation_type, items_count, duration_ms,
//!                   success, error_message, timestamp)
//! ```
//!
//! Timestamps are RFC 3339 text and structured values are JSON text.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::domain::thresholds::AlertLevel;
use crate::persistence::engine::BatchStore;
use crate::persistence::operation::{
    Batch, BatchAuditRecord, EmergencyEvent, SensorReading, SystemAlert,
};

/// Custom error types for database operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database file could not be opened or configured.
    #[error("Failed to open database at {path}: {source}")]
    ConnectionError {
        /// Database location.
        path: String,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// Creating tables or indexes failed. Startup cannot continue.
    #[error("Failed to initialize database schema: {0}")]
    SchemaError(#[source] rusqlite::Error),
    /// A statement or transaction failed.
    #[error("Query execution failed: {0}")]
    QueryError(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS devices (
        device_id TEXT PRIMARY KEY,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'offline',
        firmware_version TEXT,
        last_battery_level REAL,
        total_messages INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS sensor_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        sensor_type TEXT NOT NULL,
        value TEXT NOT NULL,
        raw_message TEXT,
        timestamp TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS emergency_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        emergency_type TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        location_data TEXT,
        sensor_context TEXT
    );
    CREATE TABLE IF NOT EXISTS system_alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        alert_type TEXT NOT NULL,
        alert_level TEXT NOT NULL,
        message TEXT NOT NULL,
        sensor_data TEXT,
        timestamp TEXT NOT NULL,
        acknowledged INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS buffer_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operation_type TEXT NOT NULL,
        items_count INTEGER NOT NULL,
        duration_ms REAL NOT NULL,
        success INTEGER NOT NULL,
        error_message TEXT,
        timestamp TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sensor_device_time ON sensor_data(device_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_alerts_device_time ON system_alerts(device_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_emergency_device ON emergency_events(device_id, status);
";

const UPSERT_DEVICE: &str = "
    INSERT INTO devices (device_id, first_seen, last_seen, status, firmware_version,
                         last_battery_level, total_messages)
    VALUES (?1, ?2, ?2, ?3, ?4, ?5, 1)
    ON CONFLICT(device_id) DO UPDATE SET
        last_seen = excluded.last_seen,
        status = excluded.status,
        firmware_version = COALESCE(excluded.firmware_version, devices.firmware_version),
        last_battery_level = COALESCE(excluded.last_battery_level, devices.last_battery_level),
        total_messages = COALESCE(devices.total_messages, 0) + 1";

/// Row of `devices`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    /// Unique key.
    pub device_id: String,
    /// First time any message was stored for the device.
    pub first_seen: DateTime<Utc>,
    /// Most recent presence update.
    pub last_seen: DateTime<Utc>,
    /// Last reported presence status.
    pub status: String,
    /// Last reported firmware version.
    pub firmware_version: Option<String>,
    /// Last reported battery level.
    pub last_battery_level: Option<f64>,
    /// Presence updates applied so far.
    pub total_messages: i64,
}

/// Row of `buffer_audit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRow {
    /// `batch_process` for worker flushes.
    pub operation_type: String,
    /// Operations in the batch.
    pub items_count: i64,
    /// Write time in milliseconds.
    pub duration_ms: f64,
    /// Whether the batch committed.
    pub success: bool,
    /// Error text of a failed batch.
    pub error_message: Option<String>,
}

/// SQLite implementation of [`BatchStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database file and initializes the schema.
    pub fn open(path: &Path, wal_mode: bool) -> Result<Self, DbError> {
        let display = path.display().to_string();
        let connection_error = |source| DbError::ConnectionError {
            path: display.clone(),
            source,
        };
        let conn = Connection::open(path).map_err(connection_error)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(connection_error)?;
        if wal_mode {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(connection_error)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(connection_error)?;
            log::info!("SQLite journal mode: {}", mode);
        }
        Self::init_schema(&conn)?;
        log::info!("Database initialized at {}", display);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database with the full schema.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().map_err(|source| DbError::ConnectionError {
            path: ":memory:".to_string(),
            source,
        })?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), DbError> {
        conn.execute_batch(SCHEMA).map_err(DbError::SchemaError)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes every operation of `batch` in one transaction.
    pub fn write(&self, batch: &Batch) -> Result<(), DbError> {
        let parts = batch.partition();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            if !parts.devices.is_empty() {
                let mut stmt = tx.prepare_cached(UPSERT_DEVICE)?;
                for d in &parts.devices {
                    stmt.execute(params![
                        d.device_id,
                        d.seen_at.to_rfc3339(),
                        d.status,
                        d.firmware_version,
                        d.battery_level,
                    ])?;
                }
            }
            if !parts.readings.is_empty() {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO sensor_data (device_id, sensor_type, value, raw_message, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for r in &parts.readings {
                    stmt.execute(params![
                        r.device_id,
                        r.sensor_type,
                        r.value.to_string(),
                        r.raw_message,
                        r.timestamp.to_rfc3339(),
                    ])?;
                }
            }
            if !parts.emergencies.is_empty() {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO emergency_events (device_id, emergency_type, start_time, end_time,
                                                   status, location_data, sensor_context)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for e in &parts.emergencies {
                    stmt.execute(params![
                        e.device_id,
                        e.emergency_type,
                        e.start_time.to_rfc3339(),
                        e.end_time.map(|t| t.to_rfc3339()),
                        e.status,
                        e.location_data.as_ref().map(Value::to_string),
                        e.sensor_context.as_ref().map(Value::to_string),
                    ])?;
                }
            }
            if !parts.alerts.is_empty() {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO system_alerts (device_id, alert_type, alert_level, message,
                                                sensor_data, timestamp, acknowledged)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for a in &parts.alerts {
                    stmt.execute(params![
                        a.device_id,
                        a.alert_type,
                        a.alert_level.as_str(),
                        a.message,
                        a.sensor_data.as_ref().map(Value::to_string),
                        a.timestamp.to_rfc3339(),
                        a.acknowledged,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Appends one row to `buffer_audit`.
    pub fn audit(&self, record: &BatchAuditRecord) -> Result<(), DbError> {
        self.lock().execute(
            "INSERT INTO buffer_audit (operation_type, items_count, duration_ms, success,
                                       error_message, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.operation_type,
                record.items_count as i64,
                record.duration.as_secs_f64() * 1000.0,
                record.success,
                record.error_message,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Reads one device row.
    pub fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, DbError> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT device_id, first_seen, last_seen, status, firmware_version,
                        last_battery_level, total_messages
                 FROM devices WHERE device_id = ?1",
                [device_id],
                |row| {
                    Ok(DeviceRecord {
                        device_id: row.get(0)?,
                        first_seen: time_at(row, 1)?,
                        last_seen: time_at(row, 2)?,
                        status: row.get(3)?,
                        firmware_version: row.get(4)?,
                        last_battery_level: row.get(5)?,
                        total_messages: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Sensor rows of one device, oldest first.
    pub fn sensor_readings(&self, device_id: &str) -> Result<Vec<SensorReading>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT device_id, sensor_type, value, raw_message, timestamp
             FROM sensor_data WHERE device_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([device_id], |row| {
                Ok(SensorReading {
                    device_id: row.get(0)?,
                    sensor_type: row.get(1)?,
                    value: json_at(row, 2)?.unwrap_or(Value::Null),
                    raw_message: row.get(3)?,
                    timestamp: time_at(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Alert rows of one device, oldest first.
    pub fn alerts(&self, device_id: &str) -> Result<Vec<SystemAlert>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT device_id, alert_type, alert_level, message, sensor_data, timestamp, acknowledged
             FROM system_alerts WHERE device_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([device_id], |row| {
                let level: String = row.get(2)?;
                Ok(SystemAlert {
                    device_id: row.get(0)?,
                    alert_type: row.get(1)?,
                    alert_level: level.parse::<AlertLevel>().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
                    })?,
                    message: row.get(3)?,
                    sensor_data: json_at(row, 4)?,
                    timestamp: time_at(row, 5)?,
                    acknowledged: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Emergency rows of one device, oldest first.
    pub fn emergency_events(&self, device_id: &str) -> Result<Vec<EmergencyEvent>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT device_id, emergency_type, start_time, end_time, status, location_data,
                    sensor_context
             FROM emergency_events WHERE device_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([device_id], |row| {
                let end: Option<String> = row.get(3)?;
                Ok(EmergencyEvent {
                    device_id: row.get(0)?,
                    emergency_type: row.get(1)?,
                    start_time: time_at(row, 2)?,
                    end_time: end.map(|s| parse_time(&s, 3)).transpose()?,
                    status: row.get(4)?,
                    location_data: json_at(row, 5)?,
                    sensor_context: json_at(row, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every audit row, oldest first.
    pub fn audit_records(&self) -> Result<Vec<AuditRow>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT operation_type, items_count, duration_ms, success, error_message
             FROM buffer_audit ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AuditRow {
                    operation_type: row.get(0)?,
                    items_count: row.get(1)?,
                    duration_ms: row.get(2)?,
                    success: row.get(3)?,
                    error_message: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl BatchStore for SqliteStore {
    fn write_batch(&self, batch: &Batch) -> anyhow::Result<()> {
        Ok(self.write(batch)?)
    }

    fn record_audit(&self, record: &BatchAuditRecord) -> anyhow::Result<()> {
        Ok(self.audit(record)?)
    }
}

fn parse_time(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_time(&raw, idx)
}

fn json_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::operation::{DeviceUpdate, Operation, QueuedOperation};
    use serde_json::json;

    fn batch(ops: Vec<Operation>) -> Batch {
        Batch::new(ops.into_iter().map(QueuedOperation::new).collect())
    }

    fn presence(id: &str, battery: Option<f64>) -> Operation {
        Operation::UpdateDevice(DeviceUpdate {
            device_id: id.into(),
            status: "online".into(),
            firmware_version: None,
            battery_level: battery,
            seen_at: Utc::now(),
        })
    }

    fn reading(id: &str) -> Operation {
        Operation::InsertSensorData(SensorReading {
            device_id: id.into(),
            sensor_type: "temperature".into(),
            value: json!({"sensor": "temperature", "value": 36.9, "unit": "C"}),
            raw_message: Some("{\"value\": 36.9}".into()),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_upsert_increments_total_messages() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .write(&batch(vec![presence("h1", Some(80.0)), presence("h1", None)]))
            .unwrap();
        store.write(&batch(vec![presence("h1", None)])).unwrap();

        let device = store.device("h1").unwrap().unwrap();
        assert_eq!(device.total_messages, 3);
        assert_eq!(device.status, "online");
        assert_eq!(device.last_battery_level, Some(80.0));
        assert!(device.first_seen <= device.last_seen);
        assert!(store.device("unknown").unwrap().is_none());
    }

    #[test]
    fn test_failed_batch_rolls_back_every_kind() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.lock().execute_batch("DROP TABLE sensor_data").unwrap();

        let err = store
            .write(&batch(vec![presence("h2", None), reading("h2")]))
            .unwrap_err();
        assert!(matches!(err, DbError::QueryError(_)));
        assert!(store.device("h2").unwrap().is_none());
    }

    #[test]
    fn test_alert_and_emergency_read_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .write(&batch(vec![
                Operation::SystemAlert(SystemAlert {
                    device_id: "h3".into(),
                    alert_type: "gas_alarm".into(),
                    alert_level: AlertLevel::Critical,
                    message: "High gas concentration detected".into(),
                    sensor_data: Some(json!({"status": "ALARM"})),
                    timestamp: now,
                    acknowledged: false,
                }),
                Operation::EmergencyEvent(EmergencyEvent {
                    device_id: "h3".into(),
                    emergency_type: "panic_button".into(),
                    start_time: now,
                    end_time: None,
                    status: "active".into(),
                    location_data: Some(json!({"latitude": 41.1, "longitude": 29.0})),
                    sensor_context: None,
                }),
                reading("h3"),
            ]))
            .unwrap();

        let alerts = store.alerts("h3").unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_level, AlertLevel::Critical);
        assert_eq!(alerts[0].sensor_data, Some(json!({"status": "ALARM"})));

        let events = store.emergency_events("h3").unwrap();
        assert_eq!(events[0].location_data.as_ref().unwrap()["latitude"], 41.1);
        assert!(events[0].end_time.is_none());

        let readings = store.sensor_readings("h3").unwrap();
        assert_eq!(readings[0].value["value"], 36.9);
    }

    #[test]
    fn test_audit_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .audit(&BatchAuditRecord::batch_process(4, Duration::from_millis(3), None))
            .unwrap();
        store
            .audit(&BatchAuditRecord::batch_process(2, Duration::ZERO, Some("locked".into())))
            .unwrap();

        let rows = store.audit_records().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].success);
        assert_eq!(rows[0].items_count, 4);
        assert!(!rows[1].success);
        assert_eq!(rows[1].error_message.as_deref(), Some("locked"));
    }

    #[test]
    fn test_open_file_with_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helmet.db");
        {
            let store = SqliteStore::open(&path, true).unwrap();
            store.write(&batch(vec![presence("h4", None)])).unwrap();
        }
        let reopened = SqliteStore::open(&path, true).unwrap();
        assert_eq!(reopened.device("h4").unwrap().unwrap().total_messages, 1);
    }
}
