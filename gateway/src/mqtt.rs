use crate::errors::{Error, Result};
use crate::ingest::Inbound;
use crate::metrics::{CHANNEL_FULL_TOTAL, MESSAGES_TOTAL};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Per-device telemetry, one topic level per device id.
pub const TELEMETRY_WILDCARD: &str = "cargo/telemetry/+";
/// Flat topic kept for producers that predate per-device topics.
pub const TELEMETRY_LEGACY: &str = "cargo/telemetry";
/// Device-originated shock alerts.
pub const SHOCK_ALERTS_TOPIC: &str = "cargo/alerts";

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    tx: mpsc::Sender<Inbound>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    if port == 8883 {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    for topic in [TELEMETRY_WILDCARD, TELEMETRY_LEGACY, SHOCK_ALERTS_TOPIC] {
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(Error::Mqtt)?;
        info!("Subscribed to {} with QoS 1", topic);
    }

    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    MESSAGES_TOTAL.inc();

                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    let msg = Inbound {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        received_at: Utc::now(),
                    };

                    if let Err(e) = forward(msg, &tx).await {
                        error!("Ingest channel closed, cannot forward message: {}", e);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll, so we just log and continue
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Hand one message to the ingest task, applying brief backpressure instead
/// of dropping when the channel is full.
async fn forward(msg: Inbound, tx: &mpsc::Sender<Inbound>) -> Result<()> {
    match tx.try_send(msg) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(msg)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Ingest channel full, using blocking send");
            tx.send(msg).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelSend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_applies_backpressure() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(1);

            let msg = |topic: &str| Inbound {
                topic: topic.to_string(),
                payload: b"{}".to_vec(),
                received_at: Utc::now(),
            };

            forward(msg("cargo/telemetry/a"), &tx).await.unwrap();

            // Channel now full; draining concurrently lets the blocking send land.
            let drainer = tokio::spawn(async move {
                let first = rx.recv().await.unwrap();
                let second = rx.recv().await.unwrap();
                (first.topic, second.topic)
            });

            forward(msg("cargo/telemetry/b"), &tx).await.unwrap();

            let (first, second) = drainer.await.unwrap();
            assert_eq!(first, "cargo/telemetry/a");
            assert_eq!(second, "cargo/telemetry/b");
        });
    }

    #[test]
    fn test_forward_closed_channel_errors() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);

            let msg = Inbound {
                topic: "cargo/telemetry/a".to_string(),
                payload: b"{}".to_vec(),
                received_at: Utc::now(),
            };

            assert!(forward(msg, &tx).await.is_err());
        });
    }
}
