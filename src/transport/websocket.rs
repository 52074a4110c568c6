//! WebSocket bus client
//!
//! Connects to the broker binary and implements [`MessageBus`] over a
//! single WebSocket connection. Frames are JSON with base64 payloads; a
//! writer task drains an outgoing queue and a reader task routes
//! deliveries to per-topic channels.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::{MessageBus, TopicSubscription, TransportError, TransportResult};

/// Frames exchanged with the broker
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[allow(missing_docs)]
pub enum BrokerFrame {
    /// Become the consumer of a topic
    Subscribe { topic: String },
    /// Publish a payload (base64) to a topic
    Publish { topic: String, payload: String },
    /// A payload delivered from a topic
    Deliver { topic: String, payload: String },
    /// Broker-side error
    Error { message: String },
    /// Ping
    Ping,
    /// Pong
    Pong,
}

type Routes = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>>;

/// A bus handle backed by one broker connection
///
/// Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct WebSocketBus {
    outgoing: mpsc::UnboundedSender<BrokerFrame>,
    routes: Routes,
}

impl WebSocketBus {
    /// Connect to a broker
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<BrokerFrame>();
        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("dropping unserializable frame: {e}");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        let reader_routes = routes.clone();
        let pong_tx = outgoing.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<BrokerFrame>(&text) {
                            Ok(BrokerFrame::Deliver { topic, payload }) => {
                                let bytes = match BASE64.decode(payload.as_bytes()) {
                                    Ok(bytes) => bytes,
                                    Err(e) => {
                                        warn!(topic = %topic, "undecodable payload: {e}");
                                        continue;
                                    }
                                };
                                let routes = reader_routes.read().await;
                                match routes.get(&topic) {
                                    Some(tx) if tx.send(bytes).is_ok() => {}
                                    _ => debug!(topic = %topic, "delivery without a live consumer"),
                                }
                            }
                            Ok(BrokerFrame::Ping) => {
                                let _ = pong_tx.send(BrokerFrame::Pong);
                            }
                            Ok(BrokerFrame::Error { message }) => {
                                warn!("broker error: {message}");
                            }
                            Ok(_) => {}
                            Err(e) => warn!("unparseable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            debug!("broker connection closed");
        });

        Ok(WebSocketBus { outgoing, routes })
    }
}

#[async_trait]
impl MessageBus for WebSocketBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> TransportResult<()> {
        self.outgoing
            .send(BrokerFrame::Publish {
                topic: topic.to_string(),
                payload: BASE64.encode(payload),
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<TopicSubscription> {
        let mut routes = self.routes.write().await;
        if routes.contains_key(topic) {
            return Err(TransportError::SubscribeFailed(format!(
                "topic {topic} already has a consumer"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(topic.to_string(), tx);
        self.outgoing
            .send(BrokerFrame::Subscribe {
                topic: topic.to_string(),
            })
            .map_err(|_| TransportError::Closed)?;

        Ok(TopicSubscription::new(topic.to_string(), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_serialization_roundtrip() {
        let frames = vec![
            BrokerFrame::Subscribe {
                topic: "a_req_pub".to_string(),
            },
            BrokerFrame::Publish {
                topic: "register".to_string(),
                payload: "AQID".to_string(),
            },
            BrokerFrame::Deliver {
                topic: "a_to_b".to_string(),
                payload: "AQID".to_string(),
            },
            BrokerFrame::Error {
                message: "no such topic".to_string(),
            },
            BrokerFrame::Ping,
            BrokerFrame::Pong,
        ];

        for frame in frames {
            let json = serde_json::to_string(&frame).unwrap();
            let parsed: BrokerFrame = serde_json::from_str(&json).unwrap();
            assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
        }
    }
}
