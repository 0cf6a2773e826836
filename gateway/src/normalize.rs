use crate::errors::{Error, Result};
use crate::model::Reading;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Device timestamps arrive either as epoch milliseconds or as an RFC 3339
/// string (the legacy producer sends ISO text).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TsValue {
    Millis(i64),
    Float(f64),
    Text(String),
}

impl TsValue {
    fn epoch_millis(self) -> Result<i64> {
        match self {
            TsValue::Millis(ms) => Ok(ms),
            TsValue::Float(ms) => Ok(ms as i64),
            TsValue::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| Error::Normalize(format!("unparseable timestamp {s:?}: {e}"))),
        }
    }
}

/// Wire shape published by current edge firmware: short keys, numeric ts.
#[derive(Debug, Deserialize)]
struct DeviceShape {
    device_id: String,
    temp: f64,
    #[serde(default)]
    hum: f64,
    #[serde(default)]
    shock_g: f64,
    lat: Option<f64>,
    lon: Option<f64>,
    battery: Option<f64>,
    #[serde(default)]
    door_open: bool,
    ts: TsValue,
}

#[derive(Debug, Deserialize)]
struct Coordinates {
    lat: f64,
    lon: f64,
}

/// Shape used by older producers: long keys, optional nested location,
/// ISO timestamp text.
#[derive(Debug, Deserialize)]
struct LegacyShape {
    device_id: String,
    temperature: f64,
    humidity: Option<f64>,
    shock_g: Option<f64>,
    shock: Option<f64>,
    lat: Option<f64>,
    lon: Option<f64>,
    location: Option<Coordinates>,
    battery: Option<f64>,
    #[serde(default)]
    door_open: bool,
    timestamp: TsValue,
}

/// Normalize a raw inbound payload into the canonical [`Reading`].
///
/// Classifies the payload shape first (a non-null `temp` key marks the
/// device shape, anything else is treated as legacy), then maps the matched
/// shape in one place. A payload without a device id, a temperature, or a
/// timestamp is rejected whole; partial records are never produced.
pub fn normalize(payload: &[u8], received_at: DateTime<Utc>) -> Result<Reading> {
    let value = serde_json::from_slice::<Value>(payload)
        .map_err(|e| Error::Normalize(format!("invalid JSON: {e}")))?;
    normalize_value(value, received_at)
}

pub fn normalize_value(value: Value, received_at: DateTime<Utc>) -> Result<Reading> {
    if value.get("temp").is_some_and(|v| !v.is_null()) {
        let shape: DeviceShape = serde_json::from_value(value)
            .map_err(|e| Error::Normalize(format!("bad device payload: {e}")))?;
        device_to_reading(shape, received_at)
    } else {
        let shape: LegacyShape = serde_json::from_value(value)
            .map_err(|e| Error::Normalize(format!("bad legacy payload: {e}")))?;
        legacy_to_reading(shape, received_at)
    }
}

fn device_to_reading(shape: DeviceShape, received_at: DateTime<Utc>) -> Result<Reading> {
    if shape.device_id.is_empty() {
        return Err(Error::Normalize("device_id is empty".to_string()));
    }
    Ok(Reading {
        device_id: shape.device_id,
        temperature: shape.temp,
        humidity: shape.hum,
        shock_g: shape.shock_g,
        lat: shape.lat,
        lon: shape.lon,
        battery: shape.battery,
        door_open: shape.door_open,
        device_ts: shape.ts.epoch_millis()?,
        received_at,
    })
}

fn legacy_to_reading(shape: LegacyShape, received_at: DateTime<Utc>) -> Result<Reading> {
    if shape.device_id.is_empty() {
        return Err(Error::Normalize("device_id is empty".to_string()));
    }
    // Flat coordinates win over the nested location object when both appear.
    let (lat, lon) = match (shape.lat, shape.lon, shape.location) {
        (Some(lat), Some(lon), _) => (Some(lat), Some(lon)),
        (_, _, Some(loc)) => (Some(loc.lat), Some(loc.lon)),
        (lat, lon, None) => (lat, lon),
    };
    Ok(Reading {
        device_id: shape.device_id,
        temperature: shape.temperature,
        humidity: shape.humidity.unwrap_or(0.0),
        shock_g: shape.shock_g.or(shape.shock).unwrap_or(0.0),
        lat,
        lon,
        battery: shape.battery,
        door_open: shape.door_open,
        device_ts: shape.timestamp.epoch_millis()?,
        received_at,
    })
}
