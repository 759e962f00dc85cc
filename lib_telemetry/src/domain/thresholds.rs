//! # Threshold Rules
//!
//! Alert derivation stated as data. Each [`ThresholdRule`] names a sensor, a
//! payload field, a condition and the alert it produces; evaluation is a pure
//! function of the rule and the payload. The default rule set is built from
//! [`AlertThresholds`], so every cutoff is configuration.
//!
//! | sensor | field | condition | alert | level |
//! |---|---|---|---|---|
//! | gas | status | `== "ALARM"` | `gas_alarm` | critical |
//! | gas | status | `== "WARNING"` | `gas_warning` | warning |
//! | temperature | value | in (high, critical] | `high_temperature` | warning |
//! | temperature | value | `> critical` | `critical_temperature` | critical |
//! | pulse_oximeter | heart_rate | outside [low, high] | `abnormal_heart_rate` | warning |
//! | pulse_oximeter | spo2 | `< low_oxygen` | `low_oxygen` | critical |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::configs::config_pipeline::AlertThresholds;
use crate::domain::payload::{self, SensorKind};

/// Severity of a system alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate action.
    Critical,
}

impl AlertLevel {
    /// Stored name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised alert level text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown alert level '{0}'")]
pub struct UnknownAlertLevel(pub String);

impl FromStr for AlertLevel {
    type Err = UnknownAlertLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AlertLevel::Info),
            "warning" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(UnknownAlertLevel(other.to_string())),
        }
    }
}

/// Test applied to one payload field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Text field equals the literal.
    Equals(String),
    /// Number strictly above the bound.
    Above(f64),
    /// Number strictly below the bound.
    Below(f64),
    /// Number below `min` or above `max`.
    Outside {
        /// Lowest accepted value.
        min: f64,
        /// Highest accepted value.
        max: f64,
    },
    /// Number in `(low, high]`.
    Between {
        /// Exclusive lower bound.
        low: f64,
        /// Inclusive upper bound.
        high: f64,
    },
}

impl Condition {
    /// Whether `field` of `payload` satisfies the condition. A missing or
    /// mistyped field never does.
    pub fn holds(&self, payload: &Value, field: &str) -> bool {
        match self {
            Condition::Equals(literal) => payload::text(payload, field) == Some(literal.as_str()),
            numeric => match payload::number(payload, field) {
                Some(v) => match numeric {
                    Condition::Above(bound) => v > *bound,
                    Condition::Below(bound) => v < *bound,
                    Condition::Outside { min, max } => v < *min || v > *max,
                    Condition::Between { low, high } => v > *low && v <= *high,
                    Condition::Equals(_) => false,
                },
                None => false,
            },
        }
    }
}

/// # Threshold Rule
///
/// `message` may contain `{value}`, replaced with the field's value.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    /// Sensor the rule applies to.
    pub sensor: SensorKind,
    /// Payload key inspected.
    pub field: String,
    /// Test on that key.
    pub condition: Condition,
    /// Alert type produced.
    pub alert_type: String,
    /// Severity produced.
    pub alert_level: AlertLevel,
    /// Alert text template.
    pub message: String,
}

/// Alert produced by a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Alert type.
    pub alert_type: String,
    /// Severity.
    pub alert_level: AlertLevel,
    /// Rendered alert text.
    pub message: String,
}

impl ThresholdRule {
    fn new(
        sensor: SensorKind,
        field: &str,
        condition: Condition,
        alert_type: &str,
        alert_level: AlertLevel,
        message: &str,
    ) -> Self {
        Self {
            sensor,
            field: field.to_string(),
            condition,
            alert_type: alert_type.to_string(),
            alert_level,
            message: message.to_string(),
        }
    }

    /// The violation this rule reports for a reading, if any.
    pub fn evaluate(&self, kind: &SensorKind, payload: &Value) -> Option<Violation> {
        if *kind != self.sensor || !self.condition.holds(payload, &self.field) {
            return None;
        }
        let value = payload::display_or(payload, &self.field, payload::MISSING);
        Some(Violation {
            alert_type: self.alert_type.clone(),
            alert_level: self.alert_level,
            message: self.message.replace("{value}", &value),
        })
    }
}

/// Ordered collection of rules.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThresholdRules {
    rules: Vec<ThresholdRule>,
}

impl ThresholdRules {
    /// The standard helmet rules with the configured cutoffs.
    pub fn from_thresholds(t: &AlertThresholds) -> Self {
        use AlertLevel::{Critical, Warning};
        use SensorKind::{Gas, PulseOximeter, Temperature};

        let rules = vec![
            ThresholdRule::new(
                Gas,
                "status",
                Condition::Equals("ALARM".into()),
                "gas_alarm",
                Critical,
                "High gas concentration detected",
            ),
            ThresholdRule::new(
                Gas,
                "status",
                Condition::Equals("WARNING".into()),
                "gas_warning",
                Warning,
                "Elevated gas concentration detected",
            ),
            ThresholdRule::new(
                Temperature,
                "value",
                Condition::Between {
                    low: t.high_temperature,
                    high: t.critical_temperature,
                },
                "high_temperature",
                Warning,
                "Elevated temperature detected: {value}°C",
            ),
            ThresholdRule::new(
                Temperature,
                "value",
                Condition::Above(t.critical_temperature),
                "critical_temperature",
                Critical,
                "Critical temperature detected: {value}°C",
            ),
            ThresholdRule::new(
                PulseOximeter,
                "heart_rate",
                Condition::Outside {
                    min: t.low_heart_rate,
                    max: t.high_heart_rate,
                },
                "abnormal_heart_rate",
                Warning,
                "Abnormal heart rate: {value} BPM",
            ),
            ThresholdRule::new(
                PulseOximeter,
                "spo2",
                Condition::Below(t.low_oxygen),
                "low_oxygen",
                Critical,
                "Low blood oxygen: {value}%",
            ),
        ];
        Self { rules }
    }

    /// Appends a rule.
    pub fn push(&mut self, rule: ThresholdRule) {
        self.rules.push(rule);
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Every violation of a reading, in rule order.
    pub fn evaluate(&self, kind: &SensorKind, payload: &Value) -> Vec<Violation> {
        self.rules
            .iter()
            .filter_map(|rule| rule.evaluate(kind, payload))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> ThresholdRules {
        ThresholdRules::from_thresholds(&AlertThresholds::default())
    }

    #[test]
    fn test_gas_alarm_is_one_critical_alert() {
        let found = rules().evaluate(&SensorKind::Gas, &json!({"value": 900, "status": "ALARM"}));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].alert_type, "gas_alarm");
        assert_eq!(found[0].alert_level, AlertLevel::Critical);

        let normal = rules().evaluate(&SensorKind::Gas, &json!({"value": 100, "status": "NORMAL"}));
        assert!(normal.is_empty());
    }

    #[test]
    fn test_low_spo2_is_critical_regardless_of_heart_rate() {
        for heart_rate in [30, 72, 190] {
            let found = rules().evaluate(
                &SensorKind::PulseOximeter,
                &json!({"heart_rate": heart_rate, "spo2": 85}),
            );
            let critical: Vec<_> = found
                .iter()
                .filter(|v| v.alert_level == AlertLevel::Critical)
                .collect();
            assert_eq!(critical.len(), 1);
            assert_eq!(critical[0].alert_type, "low_oxygen");
            assert_eq!(critical[0].message, "Low blood oxygen: 85%");
        }
    }

    #[test]
    fn test_temperature_bands_do_not_overlap() {
        let r = rules();
        assert!(r.evaluate(&SensorKind::Temperature, &json!({"value": 38.0})).is_empty());

        let warm = r.evaluate(&SensorKind::Temperature, &json!({"value": 39.2}));
        assert_eq!(warm.len(), 1);
        assert_eq!(warm[0].alert_level, AlertLevel::Warning);

        let edge = r.evaluate(&SensorKind::Temperature, &json!({"value": 40.0}));
        assert_eq!(edge[0].alert_type, "high_temperature");

        let hot = r.evaluate(&SensorKind::Temperature, &json!({"value": 41.5}));
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].alert_type, "critical_temperature");
        assert_eq!(hot[0].alert_level, AlertLevel::Critical);
    }

    #[test]
    fn test_heart_rate_band_edges() {
        let r = rules();
        let hr = |v: f64| r.evaluate(&SensorKind::PulseOximeter, &json!({"heart_rate": v}));
        assert!(hr(50.0).is_empty());
        assert!(hr(150.0).is_empty());
        assert_eq!(hr(49.0)[0].message, "Abnormal heart rate: 49.0 BPM");
        assert_eq!(hr(151.0).len(), 1);
    }

    #[test]
    fn test_missing_fields_never_fire() {
        let r = rules();
        assert!(r.evaluate(&SensorKind::PulseOximeter, &json!({})).is_empty());
        assert!(r.evaluate(&SensorKind::Temperature, &json!({"unit": "C"})).is_empty());
        assert!(r.evaluate(&SensorKind::Gps, &json!({"status": "ALARM"})).is_empty());
    }

    #[test]
    fn test_rules_follow_configuration() {
        let custom = ThresholdRules::from_thresholds(&AlertThresholds {
            low_oxygen: 95.0,
            ..AlertThresholds::default()
        });
        let found = custom.evaluate(&SensorKind::PulseOximeter, &json!({"spo2": 93}));
        assert_eq!(found.len(), 1);
        assert!("urgent".parse::<AlertLevel>().is_err());
        assert_eq!("critical".parse::<AlertLevel>().unwrap(), AlertLevel::Critical);
    }
}
