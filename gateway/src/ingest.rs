use crate::alerts::{self, AlertLimits};
use crate::errors::Result;
use crate::fanout::Broadcaster;
use crate::metrics::{INVALID_MESSAGES_TOTAL, READINGS_PERSISTED_TOTAL, SHOCK_ALERTS_TOTAL, THRESHOLD_ALERTS_TOTAL};
use crate::model::{Reading, ShockAlertEvent, ThresholdAlert};
use crate::normalize;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One raw MQTT publish, stamped with its server receipt time.
#[derive(Debug)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Storage seam for the orchestrator, implemented by the Postgres store and
/// by in-memory fakes in tests.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn insert_reading(&self, reading: &Reading) -> Result<()>;
    async fn insert_shock_alert(&self, event: &ShockAlertEvent) -> Result<()>;
}

/// Ordering of threshold-alert broadcast relative to persistence.
///
/// `BroadcastFirst` favors alert latency: a breach notification goes out to
/// live viewers even when the subsequent insert fails. `PersistFirst` gates
/// the alert on a successful insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPolicy {
    BroadcastFirst,
    PersistFirst,
}

impl AlertPolicy {
    pub fn parse(s: &str) -> Self {
        match s {
            "persist-first" => AlertPolicy::PersistFirst,
            "broadcast-first" => AlertPolicy::BroadcastFirst,
            other => {
                warn!(policy = other, "unknown alert policy, using broadcast-first");
                AlertPolicy::BroadcastFirst
            }
        }
    }
}

/// Marker the edge puts on device-originated shock alert payloads.
pub const SHOCK_ALERT_MARKER: &str = "SHOCK_DETECTED";

#[derive(Debug, Deserialize)]
struct RawShockAlert {
    device_id: String,
    shock_g: f64,
    lat: Option<f64>,
    lon: Option<f64>,
    ts: i64,
}

/// Sequences normalization, alert evaluation, persistence and fan-out for
/// every inbound message. Messages are handled strictly one at a time in
/// arrival order; a failure only ever halts the remaining effects of the
/// message it occurred on.
pub struct Orchestrator<S> {
    store: S,
    fanout: Broadcaster,
    limits: AlertLimits,
    policy: AlertPolicy,
    alerts_topic: String,
}

impl<S: ReadingStore> Orchestrator<S> {
    pub fn new(
        store: S,
        fanout: Broadcaster,
        limits: AlertLimits,
        policy: AlertPolicy,
        alerts_topic: String,
    ) -> Self {
        Self {
            store,
            fanout,
            limits,
            policy,
            alerts_topic,
        }
    }

    pub async fn handle(&self, msg: Inbound) {
        let value = match serde_json::from_slice::<Value>(&msg.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "dropping unparseable message");
                INVALID_MESSAGES_TOTAL.inc();
                return;
            }
        };

        if is_shock_alert(&msg.topic, &self.alerts_topic, &value) {
            self.handle_shock_alert(value, msg.received_at).await;
        } else {
            self.handle_telemetry(value, msg.received_at).await;
        }
    }

    async fn handle_telemetry(&self, value: Value, received_at: DateTime<Utc>) {
        let reading = match normalize::normalize_value(value, received_at) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "dropping telemetry that failed normalization");
                INVALID_MESSAGES_TOTAL.inc();
                return;
            }
        };

        let reasons = alerts::evaluate(&reading, &self.limits);
        let alert = (!reasons.is_empty()).then(|| ThresholdAlert {
            device_id: reading.device_id.clone(),
            reasons,
            reading: reading.clone(),
        });

        if let Some(alert) = &alert {
            if self.policy == AlertPolicy::BroadcastFirst {
                self.emit_threshold_alert(alert);
            }
        }

        if let Err(e) = self.store.insert_reading(&reading).await {
            error!(device_id = %reading.device_id, error = %e, "failed to persist reading, dropping");
            return;
        }
        READINGS_PERSISTED_TOTAL.inc();

        if let Some(alert) = &alert {
            if self.policy == AlertPolicy::PersistFirst {
                self.emit_threshold_alert(alert);
            }
        }

        self.fanout.broadcast("telemetry", &reading);
        debug!(device_id = %reading.device_id, "reading persisted and broadcast");
    }

    async fn handle_shock_alert(&self, value: Value, received_at: DateTime<Utc>) {
        let raw: RawShockAlert = match serde_json::from_value(value)
            .map_err(|e| crate::errors::Error::Validation(format!("incomplete shock alert: {e}")))
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "dropping shock alert");
                INVALID_MESSAGES_TOTAL.inc();
                return;
            }
        };

        let event = ShockAlertEvent {
            device_id: raw.device_id,
            shock_g: raw.shock_g,
            lat: raw.lat,
            lon: raw.lon,
            device_ts: raw.ts,
            received_at,
        };

        if let Err(e) = self.store.insert_shock_alert(&event).await {
            error!(device_id = %event.device_id, error = %e, "failed to persist shock alert, dropping");
            return;
        }
        SHOCK_ALERTS_TOTAL.inc();

        self.fanout.broadcast("shock_alert", &event);
        info!(device_id = %event.device_id, shock_g = event.shock_g, "shock alert relayed");
    }

    fn emit_threshold_alert(&self, alert: &ThresholdAlert) {
        THRESHOLD_ALERTS_TOTAL.inc();
        self.fanout.broadcast("threshold_alert", alert);
        info!(device_id = %alert.device_id, reasons = ?alert.reasons, "threshold alert broadcast");
    }
}

/// A message is a shock alert when it arrived on the dedicated alerts topic
/// or carries the edge's alert marker. Exactly one ingest path runs per
/// message.
fn is_shock_alert(topic: &str, alerts_topic: &str, value: &Value) -> bool {
    topic == alerts_topic
        || value.get("alert").and_then(Value::as_str) == Some(SHOCK_ALERT_MARKER)
}

pub async fn run_ingest<S: ReadingStore>(mut rx: mpsc::Receiver<Inbound>, orchestrator: Orchestrator<S>) {
    info!("Ingest loop started");
    while let Some(msg) = rx.recv().await {
        orchestrator.handle(msg).await;
    }
    info!("Ingest channel closed, stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_shock_alert_classification() {
        let marker = json!({"device_id": "d", "alert": "SHOCK_DETECTED", "shock_g": 5.0, "ts": 1});
        let telemetry = json!({"device_id": "d", "temp": 4.0, "ts": 1});

        assert!(is_shock_alert("cargo/alerts", "cargo/alerts", &telemetry));
        assert!(is_shock_alert("cargo/telemetry/d", "cargo/alerts", &marker));
        assert!(!is_shock_alert("cargo/telemetry/d", "cargo/alerts", &telemetry));
    }

    #[test]
    fn test_alert_policy_parse() {
        assert_eq!(AlertPolicy::parse("persist-first"), AlertPolicy::PersistFirst);
        assert_eq!(AlertPolicy::parse("broadcast-first"), AlertPolicy::BroadcastFirst);
        assert_eq!(AlertPolicy::parse("???"), AlertPolicy::BroadcastFirst);
    }

    #[derive(Default)]
    struct MemStore {
        readings: Mutex<Vec<Reading>>,
        shock_alerts: Mutex<Vec<ShockAlertEvent>>,
        fail_inserts: AtomicBool,
    }

    #[async_trait]
    impl ReadingStore for Arc<MemStore> {
        async fn insert_reading(&self, reading: &Reading) -> Result<()> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(Error::Validation("store down".to_string()));
            }
            self.readings.lock().unwrap().push(reading.clone());
            Ok(())
        }

        async fn insert_shock_alert(&self, event: &ShockAlertEvent) -> Result<()> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(Error::Validation("store down".to_string()));
            }
            self.shock_alerts.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn orchestrator(
        policy: AlertPolicy,
    ) -> (
        Orchestrator<Arc<MemStore>>,
        Arc<MemStore>,
        tokio::sync::broadcast::Receiver<String>,
    ) {
        let store = Arc::new(MemStore::default());
        let fanout = Broadcaster::new(64);
        let rx = fanout.subscribe();
        let orchestrator = Orchestrator::new(
            store.clone(),
            fanout,
            AlertLimits {
                temperature_max: 8.0,
                shock_max: 2.5,
            },
            policy,
            "cargo/alerts".to_string(),
        );
        (orchestrator, store, rx)
    }

    fn inbound(topic: &str, payload: Value) -> Inbound {
        Inbound {
            topic: topic.to_string(),
            payload: payload.to_string().into_bytes(),
            received_at: Utc::now(),
        }
    }

    fn event_name(raw: &str) -> String {
        let envelope: Value = serde_json::from_str(raw).unwrap();
        envelope["event"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_breach_persists_then_broadcasts_alert_and_telemetry() {
        tokio_test::block_on(async {
            let (orchestrator, store, mut rx) = orchestrator(AlertPolicy::BroadcastFirst);

            let msg = inbound(
                "cargo/telemetry/X",
                json!({"device_id": "X", "temp": 9.0, "hum": 50.0, "shock_g": 0.1, "ts": 1000}),
            );
            orchestrator.handle(msg).await;

            assert_eq!(store.readings.lock().unwrap().len(), 1);

            let first = rx.try_recv().unwrap();
            let envelope: Value = serde_json::from_str(&first).unwrap();
            assert_eq!(envelope["event"], "threshold_alert");
            let reasons = envelope["data"]["reasons"].as_array().unwrap();
            assert_eq!(reasons.len(), 1);
            assert!(reasons[0].as_str().unwrap().contains("temperature"));

            assert_eq!(event_name(&rx.try_recv().unwrap()), "telemetry");
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        });
    }

    #[test]
    fn test_breach_with_failing_store_still_broadcasts_alert() {
        tokio_test::block_on(async {
            let (orchestrator, store, mut rx) = orchestrator(AlertPolicy::BroadcastFirst);
            store.fail_inserts.store(true, Ordering::SeqCst);

            let msg = inbound(
                "cargo/telemetry/X",
                json!({"device_id": "X", "temp": 4.0, "hum": 50.0, "shock_g": 9.9, "ts": 1000}),
            );
            orchestrator.handle(msg).await;

            assert!(store.readings.lock().unwrap().is_empty());
            assert_eq!(event_name(&rx.try_recv().unwrap()), "threshold_alert");
            // The reading itself must not go out when persistence failed.
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        });
    }

    #[test]
    fn test_persist_first_gates_alert_on_store() {
        tokio_test::block_on(async {
            let (orchestrator, store, mut rx) = orchestrator(AlertPolicy::PersistFirst);
            store.fail_inserts.store(true, Ordering::SeqCst);

            let msg = inbound(
                "cargo/telemetry/X",
                json!({"device_id": "X", "temp": 9.0, "hum": 50.0, "shock_g": 0.1, "ts": 1000}),
            );
            orchestrator.handle(msg).await;

            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        });
    }

    #[test]
    fn test_persist_first_emits_alert_after_successful_insert() {
        tokio_test::block_on(async {
            let (orchestrator, store, mut rx) = orchestrator(AlertPolicy::PersistFirst);

            let msg = inbound(
                "cargo/telemetry/X",
                json!({"device_id": "X", "temp": 9.0, "hum": 50.0, "shock_g": 0.1, "ts": 1000}),
            );
            orchestrator.handle(msg).await;

            assert_eq!(store.readings.lock().unwrap().len(), 1);
            assert_eq!(event_name(&rx.try_recv().unwrap()), "threshold_alert");
            assert_eq!(event_name(&rx.try_recv().unwrap()), "telemetry");
        });
    }

    #[test]
    fn test_reading_within_limits_broadcasts_telemetry_only() {
        tokio_test::block_on(async {
            let (orchestrator, store, mut rx) = orchestrator(AlertPolicy::BroadcastFirst);

            let msg = inbound(
                "cargo/telemetry/X",
                json!({"device_id": "X", "temp": 4.0, "hum": 50.0, "shock_g": 0.1, "ts": 1000}),
            );
            orchestrator.handle(msg).await;

            assert_eq!(store.readings.lock().unwrap().len(), 1);
            assert_eq!(event_name(&rx.try_recv().unwrap()), "telemetry");
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        });
    }

    #[test]
    fn test_shock_alert_path_persists_and_broadcasts() {
        tokio_test::block_on(async {
            let (orchestrator, store, mut rx) = orchestrator(AlertPolicy::BroadcastFirst);

            let msg = inbound(
                "cargo/alerts",
                json!({
                    "device_id": "X",
                    "alert": "SHOCK_DETECTED",
                    "shock_g": 5.2,
                    "lat": 1.35,
                    "lon": 103.82,
                    "ts": 2000,
                }),
            );
            orchestrator.handle(msg).await;

            let stored = store.shock_alerts.lock().unwrap();
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].shock_g, 5.2);
            assert!(store.readings.lock().unwrap().is_empty());

            assert_eq!(event_name(&rx.try_recv().unwrap()), "shock_alert");
        });
    }

    #[test]
    fn test_shock_alert_missing_fields_dropped() {
        tokio_test::block_on(async {
            let (orchestrator, store, mut rx) = orchestrator(AlertPolicy::BroadcastFirst);

            let msg = inbound("cargo/alerts", json!({"device_id": "X"}));
            orchestrator.handle(msg).await;

            assert!(store.shock_alerts.lock().unwrap().is_empty());
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        });
    }

    #[test]
    fn test_malformed_telemetry_dropped() {
        tokio_test::block_on(async {
            let (orchestrator, store, mut rx) = orchestrator(AlertPolicy::BroadcastFirst);

            let msg = Inbound {
                topic: "cargo/telemetry/X".to_string(),
                payload: b"not json".to_vec(),
                received_at: Utc::now(),
            };
            orchestrator.handle(msg).await;

            assert!(store.readings.lock().unwrap().is_empty());
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        });
    }
}
