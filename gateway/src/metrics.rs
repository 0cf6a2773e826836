use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_invalid_messages_total",
        "Total inbound messages dropped as malformed or incomplete"
    ))
    .unwrap();
    pub static ref READINGS_PERSISTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_readings_persisted_total",
        "Total canonical readings written to storage"
    ))
    .unwrap();
    pub static ref SHOCK_ALERTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_shock_alerts_total",
        "Total device-originated shock alerts persisted"
    ))
    .unwrap();
    pub static ref THRESHOLD_ALERTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_threshold_alerts_total",
        "Total threshold alerts derived from readings"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_db_failures_total",
        "Total database insert failures"
    ))
    .unwrap();
    pub static ref FANOUT_EVENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_fanout_events_total",
        "Total events pushed onto the fan-out bus"
    ))
    .unwrap();
    pub static ref FANOUT_CLIENTS: Gauge = Gauge::with_opts(Opts::new(
        "gateway_fanout_clients",
        "Currently connected fan-out subscribers"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_channel_full_total",
        "Total number of times the ingest channel was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(INVALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(READINGS_PERSISTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SHOCK_ALERTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(THRESHOLD_ALERTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FANOUT_EVENTS_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(FANOUT_CLIENTS.clone())).unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
