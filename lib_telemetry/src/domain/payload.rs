//! # Sensor Payloads
//!
//! Best-effort reading of the JSON documents helmets publish. Nothing here
//! rejects a payload: unknown sensors fall through to [`SensorKind::Other`]
//! and missing keys are simply absent (or `N/A` on display paths).

use serde_json::Value;
use std::fmt;

/// Placeholder rendered for keys a payload does not carry.
pub const MISSING: &str = "N/A";

/// Sensor family of a reading.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// `{sensor: "gas", value, status, unit}`
    Gas,
    /// `{sensor: "gps", latitude, longitude, altitude}`
    Gps,
    /// `{sensor: "temperature", value, unit}`
    Temperature,
    /// `{sensor: "pulse_oximeter", heart_rate, spo2}`
    PulseOximeter,
    /// Anything else, by its lowercase name.
    Other(String),
}

impl SensorKind {
    /// Maps a sensor name to its kind. `pulse` and `pulse_oximeter` are the
    /// same sensor.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "gas" => SensorKind::Gas,
            "gps" => SensorKind::Gps,
            "temperature" | "temp" => SensorKind::Temperature,
            "pulse" | "pulse_oximeter" => SensorKind::PulseOximeter,
            other => SensorKind::Other(other.to_string()),
        }
    }

    /// The payload's `sensor` key when present, the topic subtype otherwise.
    pub fn resolve(subtype: &str, payload: &Value) -> Self {
        match payload.get("sensor").and_then(Value::as_str) {
            Some(name) if !name.trim().is_empty() => Self::from_name(name),
            _ => Self::from_name(subtype),
        }
    }

    /// Canonical name, used as `sensor_type` in storage.
    pub fn as_str(&self) -> &str {
        match self {
            SensorKind::Gas => "gas",
            SensorKind::Gps => "gps",
            SensorKind::Temperature => "temperature",
            SensorKind::PulseOximeter => "pulse_oximeter",
            SensorKind::Other(name) => name,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric view of a payload key. Numeric strings are accepted.
pub fn number(payload: &Value, key: &str) -> Option<f64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Text view of a payload key.
pub fn text<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

/// Renders a key for display, `default` when absent.
pub fn display_or(payload: &Value, key: &str, default: &str) -> String {
    match payload.get(key) {
        None | Some(Value::Null) => default.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn display(payload: &Value, key: &str) -> String {
    display_or(payload, key, MISSING)
}

/// Last known position of a device, as carried by GPS payloads.
pub fn location(payload: &Value) -> Option<Value> {
    let latitude = number(payload, "latitude")?;
    let longitude = number(payload, "longitude")?;
    let mut fix = serde_json::json!({ "latitude": latitude, "longitude": longitude });
    if let Some(altitude) = number(payload, "altitude") {
        fix["altitude"] = altitude.into();
    }
    Some(fix)
}

/// One-line human summary of a sensor reading.
pub fn describe(kind: &SensorKind, payload: &Value) -> String {
    match kind {
        SensorKind::Gas => format!(
            "Gas Value:{} {}, Status:{}",
            display(payload, "value"),
            display_or(payload, "unit", "adc"),
            display(payload, "status")
        ),
        SensorKind::Gps => format!(
            "GPS Lat:{}, Lon:{}, Alt:{}",
            display(payload, "latitude"),
            display(payload, "longitude"),
            display(payload, "altitude")
        ),
        SensorKind::Temperature => format!(
            "Temperature Value:{} {}",
            display(payload, "value"),
            display_or(payload, "unit", "celsius")
        ),
        SensorKind::PulseOximeter => format!(
            "Pulse HR:{}bpm, SpO2:{}%",
            display(payload, "heart_rate"),
            display(payload, "spo2")
        ),
        SensorKind::Other(name) => format!("{} {}", name, payload),
    }
}

/// One-line human summary of a status message.
pub fn describe_status(payload: &Value) -> String {
    format!(
        "Status {}: {}",
        display(payload, "status"),
        display_or(payload, "message", "")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_resolution() {
        assert_eq!(SensorKind::resolve("pulse", &json!({})), SensorKind::PulseOximeter);
        assert_eq!(
            SensorKind::resolve("vitals", &json!({"sensor": "pulse_oximeter"})),
            SensorKind::PulseOximeter
        );
        assert_eq!(SensorKind::resolve("GAS", &json!({"value": 3})), SensorKind::Gas);
        assert_eq!(
            SensorKind::resolve("co2", &json!({})),
            SensorKind::Other("co2".into())
        );
        assert_eq!(SensorKind::Temperature.to_string(), "temperature");
    }

    #[test]
    fn test_describe_uses_placeholders() {
        assert_eq!(
            describe(&SensorKind::Gas, &json!({"value": 812})),
            "Gas Value:812 adc, Status:N/A"
        );
        assert_eq!(
            describe(&SensorKind::PulseOximeter, &json!({"heart_rate": 72})),
            "Pulse HR:72bpm, SpO2:N/A%"
        );
        assert_eq!(
            describe_status(&json!({"status": "active"})),
            "Status active: "
        );
    }

    #[test]
    fn test_number_accepts_numeric_strings() {
        let payload = json!({"value": "39.5", "status": "ALARM", "spo2": null});
        assert_eq!(number(&payload, "value"), Some(39.5));
        assert_eq!(number(&payload, "status"), None);
        assert_eq!(number(&payload, "spo2"), None);
        assert_eq!(text(&payload, "status"), Some("ALARM"));
    }

    #[test]
    fn test_location_requires_both_coordinates() {
        assert!(location(&json!({"latitude": 41.0})).is_none());
        let fix = location(&json!({"latitude": 41.0, "longitude": 29.0, "altitude": 120})).unwrap();
        assert_eq!(fix["altitude"], 120.0);
    }
}
