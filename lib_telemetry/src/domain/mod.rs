//! # Domain
//!
//! What the pipeline knows about helmets: payload shapes, alert thresholds and
//! the handlers that turn telemetry into stored records.

/// Telemetry handlers and per-device emergency state.
pub mod integration;
/// Sensor kinds, payload accessors and display summaries.
pub mod payload;
/// Data-driven alert rules.
pub mod thresholds;

pub use integration::{DomainIntegration, EmergencyState, IntegrationStats};
pub use payload::SensorKind;
pub use thresholds::{AlertLevel, Condition, ThresholdRule, ThresholdRules, Violation};
