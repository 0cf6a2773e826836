use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical sensor reading, the single record shape used everywhere on the
/// gateway once an inbound payload has been normalized.
///
/// `device_ts` is device-local epoch milliseconds and is only monotonic
/// within one boot session of the device. `received_at` is assigned by the
/// gateway at MQTT receipt and is the sole ordering key for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub shock_g: f64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub battery: Option<f64>,
    pub door_open: bool,
    #[serde(rename = "timestamp")]
    pub device_ts: i64,
    pub received_at: DateTime<Utc>,
}

/// Shock alert emitted by the device itself when instantaneous acceleration
/// crossed its onboard threshold. Bypasses gateway threshold evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ShockAlertEvent {
    pub device_id: String,
    pub shock_g: f64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(rename = "ts")]
    pub device_ts: i64,
    pub received_at: DateTime<Utc>,
}

/// Threshold breach derived from a Reading. A view over the reading, only
/// ever broadcast; never stored on its own.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdAlert {
    pub device_id: String,
    pub reasons: Vec<String>,
    pub reading: Reading,
}

/// REST API response wrapper for reading/alert listings
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub limit: usize,
}

/// One device seen within the requested trailing window
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct DeviceSummary {
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
    pub readings: i64,
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub data: Vec<DeviceSummary>,
    pub total: usize,
    pub window_secs: u64,
}
