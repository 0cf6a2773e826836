use clap::Parser;
use std::path::PathBuf;

/// Edge agent configuration. Every knob can come from the command line or
/// the matching environment variable, with defaults that talk to a local
/// broker.
#[derive(Parser, Debug, Clone)]
#[command(name = "edge-agent", about = "Shipping-container telemetry edge agent")]
pub struct Config {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    pub broker: String,

    /// Broker port; 8883 switches the transport to TLS.
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub port: u16,

    #[arg(long, env = "DEVICE_ID", default_value = "CARGO-ESP32-001")]
    pub device_id: String,

    /// Offline buffer file. Its presence signals undrained data.
    #[arg(long, env = "BUFFER_PATH", default_value = "offline_buffer.log")]
    pub buffer_path: PathBuf,

    /// Oldest records are evicted beyond this count.
    #[arg(long, env = "BUFFER_MAX_RECORDS", default_value_t = 10_000)]
    pub buffer_max_records: usize,

    #[arg(long, env = "MOTION_INTERVAL_MS", default_value_t = 20)]
    pub motion_interval_ms: u64,

    #[arg(long, env = "TELEMETRY_INTERVAL_MS", default_value_t = 5_000)]
    pub telemetry_interval_ms: u64,

    #[arg(long, env = "CONNECT_RETRY_MS", default_value_t = 5_000)]
    pub connect_retry_ms: u64,

    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Instantaneous acceleration above this emits a shock alert ahead of
    /// normal telemetry.
    #[arg(long, env = "SHOCK_THRESHOLD_G", default_value_t = 2.5)]
    pub shock_threshold_g: f64,

    #[arg(long, env = "BASE_LAT", default_value_t = 1.3521)]
    pub base_lat: f64,

    #[arg(long, env = "BASE_LON", default_value_t = 103.8198)]
    pub base_lon: f64,
}
