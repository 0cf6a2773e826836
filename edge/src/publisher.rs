use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Where the buffer replays records to. Implemented by the real transport
/// and by scripted fakes in tests.
#[async_trait(?Send)]
pub trait PublishSink {
    async fn publish(&mut self, topic: &str, payload: &str) -> bool;
    /// Give the underlying session a chance to exchange keep-alive traffic.
    async fn service(&mut self);
}

/// How long a single event-loop service poll may block. Keeps every
/// scheduler iteration bounded.
const SERVICE_POLL: Duration = Duration::from_millis(10);

/// Thin wrapper over a persistent MQTT session.
///
/// The event loop is only ever polled from here, and only when the
/// scheduler decides to: reconnect pacing is the scheduler's job, not this
/// type's. `publish` never blocks waiting for connectivity; it reports
/// failure so the caller can fall back to the offline buffer synchronously.
pub struct TransportPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
}

impl TransportPublisher {
    pub fn new(broker: &str, port: u16, device_id: &str) -> Self {
        let client_id = format!("edge-{}-{}", device_id, uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, broker, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(false);
        if port == 8883 {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        Self {
            client,
            eventloop,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Drive the event loop until the session is established or the
    /// deadline passes. One bounded connect attempt; the scheduler decides
    /// when to try again.
    pub async fn try_connect(&mut self, connect_timeout: Duration) -> bool {
        let deadline = Instant::now() + connect_timeout;
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    info!("MQTT session established");
                    self.connected = true;
                    return true;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!(error = %e, "connect attempt failed");
                    return false;
                }
                Err(_) => {
                    debug!("connect attempt timed out");
                    return false;
                }
            }
        }
        false
    }

    /// One bounded event-loop poll: acknowledgments, keep-alive, and
    /// connection-state transitions all surface here.
    pub async fn service_once(&mut self) {
        match timeout(SERVICE_POLL, self.eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                if !self.connected {
                    info!("MQTT session established");
                }
                self.connected = true;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if self.connected {
                    warn!(error = %e, "MQTT connection lost");
                }
                self.connected = false;
            }
            Err(_) => {} // nothing ready within the poll window
        }
    }

    /// Non-blocking publish. False means the caller should buffer.
    pub async fn try_publish(&mut self, topic: &str, payload: &str) -> bool {
        if !self.connected {
            return false;
        }
        match self.client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "publish failed");
                false
            }
        }
    }
}

#[async_trait(?Send)]
impl PublishSink for TransportPublisher {
    async fn publish(&mut self, topic: &str, payload: &str) -> bool {
        self.try_publish(topic, payload).await
    }

    async fn service(&mut self) {
        self.service_once().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_fails_fast_when_disconnected() {
        tokio_test::block_on(async {
            let mut publisher = TransportPublisher::new("localhost", 1883, "test-dev");
            assert!(!publisher.is_connected());
            assert!(!publisher.try_publish("cargo/telemetry/test-dev", "{}").await);
        });
    }
}
