use serde::Serialize;

/// Dedicated topic for device-originated shock alerts.
pub const ALERTS_TOPIC: &str = "cargo/alerts";

/// Telemetry wire payload. Short keys keep the frame small for the
/// transport's maximum frame size; `ts` is epoch milliseconds from the
/// device clock.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload {
    pub device_id: String,
    pub temp: f64,
    pub hum: f64,
    pub shock_g: f64,
    pub lat: f64,
    pub lon: f64,
    pub battery: f64,
    pub door_open: bool,
    pub ts: i64,
}

impl TelemetryPayload {
    pub fn topic(&self) -> String {
        format!("cargo/telemetry/{}", self.device_id)
    }
}

/// Shock alert wire payload, published outside the telemetry cadence.
#[derive(Debug, Clone, Serialize)]
pub struct ShockAlertPayload {
    pub device_id: String,
    pub alert: &'static str,
    pub shock_g: f64,
    pub lat: f64,
    pub lon: f64,
    pub ts: i64,
}

impl ShockAlertPayload {
    pub fn new(device_id: String, shock_g: f64, lat: f64, lon: f64, ts: i64) -> Self {
        Self {
            device_id,
            alert: "SHOCK_DETECTED",
            shock_g,
            lat,
            lon,
            ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_topic_is_per_device() {
        let payload = TelemetryPayload {
            device_id: "CARGO-ESP32-001".to_string(),
            temp: 4.2,
            hum: 60.0,
            shock_g: 0.1,
            lat: 1.35,
            lon: 103.82,
            battery: 87.0,
            door_open: false,
            ts: 1000,
        };
        assert_eq!(payload.topic(), "cargo/telemetry/CARGO-ESP32-001");
    }

    #[test]
    fn test_shock_alert_carries_marker() {
        let alert = ShockAlertPayload::new("dev-1".to_string(), 5.0, 1.0, 2.0, 1000);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["alert"], "SHOCK_DETECTED");
        assert_eq!(json["shock_g"], 5.0);
    }
}
