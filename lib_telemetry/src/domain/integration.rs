//! # Domain Integration
//!
//! The bridge between dispatched telemetry and the persistence engine. It is
//! registered under the catch-all pattern of both categories and, for every
//! message, queues a presence update, the reading itself, and whatever alerts
//! the threshold rules or the status message call for.
//!
//! Per-device emergency state is explicit and owned here: a device moves
//! `Free → Active` on its first emergency signal whose event the persistence
//! queue accepts, and only an operator call to
//! [`DomainIntegration::resolve_emergency`] moves it on to `Resolved`. Repeated
//! signals while `Active` queue nothing new. A refused event leaves the state
//! unchanged so the next signal tries again.
//!
//! Handlers only enqueue. All storage work happens on the batch worker.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::configs::config_pipeline::AlertThresholds;
use crate::core::dispatcher::Dispatcher;
use crate::core::ingest_buffer::RawMessage;
use crate::core::registry::{Category, HandlerId, HandlerPattern};
use crate::domain::payload::{self, SensorKind};
use crate::domain::thresholds::{AlertLevel, ThresholdRules};
use crate::persistence::engine::PersistenceEngine;

/// Emergency lifecycle of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyState {
    /// No emergency seen, or none since the last resolution.
    #[default]
    Free,
    /// Emergency reported and not yet resolved.
    Active,
    /// Resolved by an operator. A new signal re-activates it.
    Resolved,
}

#[derive(Debug, Default)]
struct DeviceState {
    emergency: EmergencyState,
    last_location: Option<Value>,
}

/// Integration counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegrationStats {
    /// Sensor messages handled.
    pub sensor_events: u64,
    /// Status messages handled.
    pub status_events: u64,
    /// Alerts accepted by the persistence queue.
    pub alerts_raised: u64,
    /// Emergencies opened.
    pub emergencies_raised: u64,
    /// Operations the persistence queue refused.
    pub operations_rejected: u64,
}

#[derive(Default)]
struct Counters {
    sensor_events: AtomicU64,
    status_events: AtomicU64,
    alerts_raised: AtomicU64,
    emergencies_raised: AtomicU64,
    operations_rejected: AtomicU64,
}

/// Translates telemetry into persistence operations.
pub struct DomainIntegration {
    engine: Arc<PersistenceEngine>,
    rules: ThresholdRules,
    devices: Mutex<HashMap<String, DeviceState>>,
    counters: Counters,
}

impl DomainIntegration {
    /// Integration using the standard rules with the given cutoffs.
    pub fn new(engine: Arc<PersistenceEngine>, thresholds: &AlertThresholds) -> Self {
        Self::with_rules(engine, ThresholdRules::from_thresholds(thresholds))
    }

    /// Integration using a custom rule set.
    pub fn with_rules(engine: Arc<PersistenceEngine>, rules: ThresholdRules) -> Self {
        Self {
            engine,
            rules,
            devices: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Registers the sensor and status handlers under their catch-all
    /// patterns.
    pub fn register(self: &Arc<Self>, dispatcher: &Dispatcher) -> [HandlerId; 2] {
        let sensors = Arc::clone(self);
        let status = Arc::clone(self);
        [
            dispatcher.register(
                Category::Sensors,
                HandlerPattern::CatchAll,
                Arc::new(move |device, subtype, data, raw| {
                    sensors.handle_sensor(device, subtype, data, raw)
                }),
            ),
            dispatcher.register(
                Category::Status,
                HandlerPattern::CatchAll,
                Arc::new(move |device, subtype, data, raw| {
                    status.handle_status(device, subtype, data, raw)
                }),
            ),
        ]
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<String, DeviceState>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepted(&self, accepted: bool, what: &str, device_id: &str) -> bool {
        if !accepted {
            self.counters.operations_rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("Failed to queue {} for {}", what, device_id);
        }
        accepted
    }

    fn mark_online(&self, device_id: &str, data: &Value) {
        let queued = self.engine.update_device_status(
            device_id,
            "online",
            payload::text(data, "firmware_version").map(str::to_string),
            payload::number(data, "battery_level"),
        );
        self.accepted(queued, "device update", device_id);
    }

    fn raise_alert(&self, device_id: &str, alert_type: &str, level: AlertLevel, message: &str, data: &Value) {
        let queued = self
            .engine
            .create_system_alert(device_id, alert_type, level, message, Some(data.clone()));
        if self.accepted(queued, "system alert", device_id) {
            self.counters.alerts_raised.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// # Sensor Handler
    ///
    /// Presence update, reading insert, then one alert per violated rule.
    pub fn handle_sensor(
        &self,
        device_id: &str,
        subtype: &str,
        data: &Value,
        raw: &RawMessage,
    ) -> anyhow::Result<()> {
        self.counters.sensor_events.fetch_add(1, Ordering::Relaxed);
        let kind = SensorKind::resolve(subtype, data);

        self.mark_online(device_id, data);
        if kind == SensorKind::Gps {
            if let Some(fix) = payload::location(data) {
                self.devices().entry(device_id.to_string()).or_default().last_location = Some(fix);
            }
        }

        let queued = self.engine.insert_sensor_data(
            device_id,
            kind.as_str(),
            data.clone(),
            Some(raw.payload.clone()),
        );
        self.accepted(queued, "sensor data", device_id);

        for violation in self.rules.evaluate(&kind, data) {
            log::warn!(
                "{} alert for {}: {}",
                violation.alert_level,
                device_id,
                violation.message
            );
            self.raise_alert(
                device_id,
                &violation.alert_type,
                violation.alert_level,
                &violation.message,
                data,
            );
        }
        Ok(())
    }

    /// # Status Handler
    ///
    /// Presence update, then emergency or warning handling.
    pub fn handle_status(
        &self,
        device_id: &str,
        subtype: &str,
        data: &Value,
        _raw: &RawMessage,
    ) -> anyhow::Result<()> {
        self.counters.status_events.fetch_add(1, Ordering::Relaxed);
        self.mark_online(device_id, data);

        let status = payload::text(data, "status").unwrap_or_default();
        let emergency = subtype == "emergency"
            || status.eq_ignore_ascii_case("emergency")
            || status.eq_ignore_ascii_case("emergency_active");

        if emergency {
            self.trigger_emergency(device_id, data);
        } else if subtype == "warning" || status.eq_ignore_ascii_case("warning") {
            let message = payload::text(data, "message").unwrap_or("Unknown warning");
            self.raise_alert(device_id, "warning", AlertLevel::Warning, message, data);
        }
        Ok(())
    }

    fn trigger_emergency(&self, device_id: &str, data: &Value) {
        // Claim the transition under the lock so a concurrent signal sees
        // `Active`, and remember what to restore if the event is refused.
        let (previous, location) = {
            let mut devices = self.devices();
            let state = devices.entry(device_id.to_string()).or_default();
            if state.emergency == EmergencyState::Active {
                log::debug!("Emergency already active for {}", device_id);
                return;
            }
            let previous = state.emergency;
            state.emergency = EmergencyState::Active;
            (previous, state.last_location.clone())
        };

        let kind = payload::text(data, "message").unwrap_or("unknown");
        let banner = "!!!".repeat(20);
        log::error!("{}", banner);
        log::error!("EMERGENCY ALERT - Device: {} - Type: {}", device_id, kind);
        log::error!("{}", banner);

        let queued = self.engine.record_emergency_event(
            device_id,
            kind,
            location,
            Some(data.clone()),
        );
        if !self.accepted(queued, "emergency event", device_id) {
            // Not stored: leave the device open to the next signal.
            if let Some(state) = self.devices().get_mut(device_id) {
                if state.emergency == EmergencyState::Active {
                    state.emergency = previous;
                }
            }
            return;
        }
        self.counters.emergencies_raised.fetch_add(1, Ordering::Relaxed);
        self.raise_alert(
            device_id,
            "emergency",
            AlertLevel::Critical,
            &format!("Emergency detected: {}", kind),
            data,
        );
    }

    /// Emergency state of a device. Unknown devices are `Free`.
    pub fn emergency_state(&self, device_id: &str) -> EmergencyState {
        self.devices()
            .get(device_id)
            .map(|s| s.emergency)
            .unwrap_or_default()
    }

    /// Devices currently in an active emergency.
    pub fn active_emergencies(&self) -> Vec<String> {
        let mut active: Vec<String> = self
            .devices()
            .iter()
            .filter(|(_, s)| s.emergency == EmergencyState::Active)
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();
        active
    }

    /// Operator action: `Active → Resolved`. Returns false when the device
    /// had no active emergency.
    pub fn resolve_emergency(&self, device_id: &str) -> bool {
        match self.devices().get_mut(device_id) {
            Some(state) if state.emergency == EmergencyState::Active => {
                state.emergency = EmergencyState::Resolved;
                log::info!("Emergency resolved for {}", device_id);
                true
            }
            _ => false,
        }
    }

    /// Current counters.
    pub fn stats(&self) -> IntegrationStats {
        let c = &self.counters;
        IntegrationStats {
            sensor_events: c.sensor_events.load(Ordering::Relaxed),
            status_events: c.status_events.load(Ordering::Relaxed),
            alerts_raised: c.alerts_raised.load(Ordering::Relaxed),
            emergencies_raised: c.emergencies_raised.load(Ordering::Relaxed),
            operations_rejected: c.operations_rejected.load(Ordering::Relaxed),
        }
    }
}
