//! Telemetry Messages

use crate::DecodeError;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded device reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Device identity (second topic segment)
    pub device: String,
    /// Temperature (°C); `None` when the device sent `null`
    pub temperature: Option<f64>,
    /// Relative humidity in percent (0-100)
    pub humidity: Option<f64>,
    /// Arrival time
    pub observed_at: DateTime<FixedOffset>,
}

impl Reading {
    /// Humidity as a 0-1 fraction
    pub fn humidity_fraction(&self) -> Option<f64> {
        self.humidity.map(|h| round2(h / 100.0))
    }
}

/// Device identity for a topic, or `None` for topics that carry no device
/// telemetry (no second segment, or the reserved control segment).
pub fn device_from_topic<'a>(topic: &'a str, reserved: &str) -> Option<&'a str> {
    let device = topic.split('/').nth(1)?;
    if device.is_empty() || device == reserved {
        return None;
    }
    Some(device)
}

/// Decode a JSON telemetry payload.
///
/// Both `temperature` and `humidity` keys are required. A JSON `null` is
/// accepted and recorded as a missing value.
pub fn decode_payload(
    device: &str,
    payload: &[u8],
    observed_at: DateTime<FixedOffset>,
) -> Result<Reading, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let temperature = numeric_field(object, "temperature")?;
    let humidity = numeric_field(object, "humidity")?;

    Ok(Reading {
        device: device.to_string(),
        temperature,
        humidity,
        observed_at,
    })
}

fn numeric_field(
    object: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, DecodeError> {
    match object.get(field) {
        None => Err(DecodeError::MissingField(field)),
        Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .filter(|v| v.is_finite())
            .map(|v| Some(round2(v)))
            .ok_or(DecodeError::InvalidField { field }),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
