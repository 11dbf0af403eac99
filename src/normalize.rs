//! Measurement normalization at the ingestion boundary.
//!
//! Devices report readings either as numbers or as unit-bearing strings
//! (`"2.5°C"`, `"61%"`, `"40 km/h"`). Everything downstream of ingestion works
//! on `f64`, so conversion happens exactly once, here.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::DataQualityWarning;
use crate::model::{DeviceState, RawTelemetry, Reading};

/// Parse a reading that may carry a trailing unit suffix.
///
/// Returns `None` for anything that does not leave a finite number once the
/// suffix is removed.
pub fn parse_measurement(raw: &str) -> Option<f64> {
    let numeric = raw
        .trim()
        .trim_end_matches(|c: char| !(c.is_ascii_digit() || c == '.'));

    numeric.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

impl Reading {
    /// The numeric value, if one can be extracted.
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Number(v) => Some(*v).filter(|v| v.is_finite()),
            Reading::Text(s) => parse_measurement(s),
        }
    }

    fn raw(&self) -> String {
        match self {
            Reading::Number(v) => v.to_string(),
            Reading::Text(s) => s.clone(),
        }
    }
}

/// Turn an inbound reading into a typed [`DeviceState`].
///
/// Unparsable required readings default to `0.0`; an unparsable speed is
/// dropped. Either way a [`DataQualityWarning`] is logged and returned.
pub fn normalize_reading(
    raw: RawTelemetry,
    received_at: DateTime<Utc>,
) -> (DeviceState, Vec<DataQualityWarning>) {
    let mut warnings = Vec::new();

    let mut numeric = |field: &'static str, reading: &Reading| -> Option<f64> {
        let value = reading.value();
        if value.is_none() {
            let warning = DataQualityWarning {
                device_id: raw.id.clone(),
                field,
                raw: reading.raw(),
            };
            warn!(
                device_id = %warning.device_id,
                field,
                raw = %warning.raw,
                "Unparsable reading"
            );
            warnings.push(warning);
        }
        value
    };

    let temperature = numeric("temperature", &raw.temperature).unwrap_or(0.0);
    let humidity = numeric("humidity", &raw.humidity).unwrap_or(0.0);
    let oxygen_level = numeric("oxygen_level", &raw.oxygen_level).unwrap_or(0.0);
    let speed = raw.speed.as_ref().and_then(|s| numeric("speed", s));

    let state = DeviceState {
        name: raw.name.clone().unwrap_or_else(|| raw.id.clone()),
        id: raw.id,
        status: raw.status,
        temperature,
        humidity,
        oxygen_level,
        location: raw.location,
        speed,
        last_update: raw.timestamp.unwrap_or(received_at),
    };

    (state, warnings)
}
