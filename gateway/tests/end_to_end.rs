//! End-to-end smoke test against a running stack (broker + gateway).
//!
//! Requires mosquitto (or any MQTT broker) on localhost:1883 and the gateway
//! running with its defaults, so it is ignored by default:
//!
//!   cargo test -p gateway --test end_to_end -- --ignored

use futures_util::StreamExt;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

#[tokio::test]
#[ignore]
async fn test_breach_reaches_live_subscriber() {
    // Subscribe to the fan-out stream first so we see our own message.
    let (ws_stream, _) = connect_async("ws://localhost:8081")
        .await
        .expect("gateway fan-out not reachable");
    let (_, mut ws_read) = ws_stream.split();

    let mut mqtt_options = MqttOptions::new("e2e-test", "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);

    tokio::spawn(async move {
        loop {
            if eventloop.poll().await.is_err() {
                break;
            }
        }
    });

    let payload = json!({
        "device_id": "E2E-DEVICE",
        "temp": 9.0,
        "hum": 50.0,
        "shock_g": 0.1,
        "ts": 1000,
    });
    client
        .publish(
            "cargo/telemetry/E2E-DEVICE",
            QoS::AtLeastOnce,
            false,
            payload.to_string(),
        )
        .await
        .expect("publish failed");

    // Default policy is broadcast-first: threshold_alert, then telemetry.
    let mut events = Vec::new();
    while events.len() < 2 {
        let msg = timeout(Duration::from_secs(5), ws_read.next())
            .await
            .expect("timed out waiting for fan-out event")
            .expect("fan-out stream closed")
            .expect("fan-out stream error");
        let envelope: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        if envelope["data"]["device_id"] == "E2E-DEVICE" {
            events.push(envelope);
        }
    }

    assert_eq!(events[0]["event"], "threshold_alert");
    assert!(events[0]["data"]["reasons"][0]
        .as_str()
        .unwrap()
        .contains("temperature"));
    assert_eq!(events[1]["event"], "telemetry");
    assert_eq!(events[1]["data"]["temperature"], 9.0);
}
