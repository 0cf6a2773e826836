use crate::errors::Result;
use crate::metrics::{FANOUT_CLIENTS, FANOUT_EVENTS_TOTAL};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type SessionRegistry = Arc<RwLock<HashMap<Uuid, SocketAddr>>>;

/// Handle onto the fan-out bus. Cheap to clone; events are serialized once
/// and distributed to every live subscriber through a broadcast channel.
/// Delivery is best-effort: a subscriber that connects after an event was
/// sent, disconnects mid-send, or lags behind the channel capacity simply
/// misses events.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<String>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Push one event to all currently-connected subscribers.
    pub fn broadcast<T: Serialize>(&self, event: &str, data: &T) {
        let envelope = match serde_json::to_value(data) {
            Ok(value) => serde_json::json!({"event": event, "data": value}),
            Err(e) => {
                error!(event, error = %e, "failed to serialize fan-out event");
                return;
            }
        };
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(envelope.to_string());
        FANOUT_EVENTS_TOTAL.inc();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Accept loop for the WebSocket fan-out listener. Each session gets its
/// own forwarding task and its own broadcast receiver.
pub async fn run_server(addr: String, broadcaster: Broadcaster) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("Fan-out listening on ws://{}", addr);

    let sessions: SessionRegistry = Arc::new(RwLock::new(HashMap::new()));

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let sessions = sessions.clone();
                let rx = broadcaster.subscribe();
                tokio::spawn(handle_session(stream, peer, sessions, rx));
            }
            Err(e) => {
                error!("Fan-out accept error: {}", e);
            }
        }
    }
}

async fn handle_session(
    stream: TcpStream,
    peer: SocketAddr,
    sessions: SessionRegistry,
    mut rx: broadcast::Receiver<String>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {}: {}", peer, e);
            return;
        }
    };

    let session_id = Uuid::new_v4();
    {
        let mut sessions = sessions.write().await;
        sessions.insert(session_id, peer);
        FANOUT_CLIENTS.set(sessions.len() as f64);
    }
    info!(%peer, %session_id, "subscriber connected");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.trim() == "ping" {
                            let _ = ws_sender.send(Message::Text("pong".to_string())).await;
                        } else {
                            debug!(%peer, "ignoring subscriber message");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", peer, e);
                        break;
                    }
                    _ => {}
                }
            }

            event = rx.recv() => {
                match event {
                    Ok(json) => {
                        if let Err(e) = ws_sender.send(Message::Text(json)).await {
                            warn!("Failed to send to {}: {}", peer, e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%peer, skipped, "subscriber lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    {
        let mut sessions = sessions.write().await;
        sessions.remove(&session_id);
        FANOUT_CLIENTS.set(sessions.len() as f64);
    }
    info!(%peer, "subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_subscriber() {
        tokio_test::block_on(async {
            let broadcaster = Broadcaster::new(16);
            let mut rx = broadcaster.subscribe();

            broadcaster.broadcast("telemetry", &serde_json::json!({"device_id": "dev-1"}));

            let raw = rx.recv().await.unwrap();
            let envelope: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(envelope["event"], "telemetry");
            assert_eq!(envelope["data"]["device_id"], "dev-1");
        });
    }

    #[test]
    fn test_broadcast_without_subscribers_is_noop() {
        let broadcaster = Broadcaster::new(16);
        broadcaster.broadcast("telemetry", &serde_json::json!({}));
    }
}
