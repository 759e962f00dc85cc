//! Human-readable activity log.
//!
//! Registers catch-all collaborator handlers next to the domain handlers and
//! logs a one-line summary of every dispatched message.

use lib_telemetry::domain::payload::{SensorKind, describe, describe_status};
use lib_telemetry::{Category, HandlerId, HandlerPattern, Pipeline, RawMessage};
use serde_json::Value;
use std::sync::Arc;

pub fn register(pipeline: &Pipeline) -> [HandlerId; 2] {
    let sensors = pipeline.register_handler(
        Category::Sensors,
        HandlerPattern::CatchAll,
        Arc::new(|device_id: &str, subtype: &str, payload: &Value, _raw: &RawMessage| {
            let kind = SensorKind::resolve(subtype, payload);
            log::info!("[{}] {}", device_id, describe(&kind, payload));
            Ok(())
        }),
    );
    let status = pipeline.register_handler(
        Category::Status,
        HandlerPattern::CatchAll,
        Arc::new(|device_id: &str, _subtype: &str, payload: &Value, _raw: &RawMessage| {
            log::info!("[{}] {}", device_id, describe_status(payload));
            Ok(())
        }),
    );
    [sensors, status]
}
