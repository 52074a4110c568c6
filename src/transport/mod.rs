//! Topic-addressed message bus
//!
//! The protocol core only ever publishes bytes to a named topic and
//! consumes bytes from topics it subscribed to. The bus guarantees
//! at-least-once, per-topic FIFO delivery to a single consumer; it
//! knows nothing about what the bytes mean.
//!
//! Two implementations: an in-memory bus for tests and single-process
//! runs, and a WebSocket client that talks to the broker binary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod websocket;
pub use websocket::WebSocketBus;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection to the broker failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The bus connection is gone
    #[error("Bus connection closed")]
    Closed,

    /// A subscription could not be opened
    #[error("Failed to subscribe: {0}")]
    SubscribeFailed(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Abstract publish/subscribe bus
///
/// Implementations move bytes; encryption is the session layer's
/// business and bundle redaction the coordinator's.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: &[u8]) -> TransportResult<()>;

    /// Open the single consumer subscription for a topic
    async fn subscribe(&self, topic: &str) -> TransportResult<TopicSubscription>;
}

/// The consuming end of one topic
///
/// Dropping (or closing) the subscription is the clean-shutdown path
/// for the listener that owns it: the worker finishes its in-flight
/// message and then sees the stream end.
pub struct TopicSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TopicSubscription {
    pub(crate) fn new(topic: String, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        TopicSubscription { topic, rx }
    }

    /// Await the next message; `None` once the bus side is gone
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// The topic this subscription consumes
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop accepting new messages; buffered ones still drain
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// In-memory bus for tests and single-process runs
pub mod memory {
    use super::*;

    struct TopicQueue {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        /// Receiver parked here until someone subscribes, buffering
        /// anything published early
        parked: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    impl TopicQueue {
        fn fresh() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            TopicQueue {
                tx,
                parked: Some(rx),
            }
        }
    }

    /// A process-local topic bus backed by unbounded channels
    #[derive(Clone, Default)]
    pub struct InMemoryBus {
        topics: Arc<Mutex<HashMap<String, TopicQueue>>>,
    }

    impl InMemoryBus {
        /// Create an empty bus
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl MessageBus for InMemoryBus {
        async fn publish(&self, topic: &str, payload: &[u8]) -> TransportResult<()> {
            let mut topics = self.topics.lock().expect("bus lock poisoned");
            let queue = topics
                .entry(topic.to_string())
                .or_insert_with(TopicQueue::fresh);

            if queue.tx.send(payload.to_vec()).is_err() {
                // Consumer went away; start a fresh queue and buffer there
                *queue = TopicQueue::fresh();
                queue
                    .tx
                    .send(payload.to_vec())
                    .expect("freshly parked queue accepts sends");
            }
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> TransportResult<TopicSubscription> {
            let mut topics = self.topics.lock().expect("bus lock poisoned");
            let queue = topics
                .entry(topic.to_string())
                .or_insert_with(TopicQueue::fresh);

            let rx = queue.parked.take().ok_or_else(|| {
                TransportError::SubscribeFailed(format!("topic {topic} already has a consumer"))
            })?;
            Ok(TopicSubscription::new(topic.to_string(), rx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryBus;
    use super::*;

    #[tokio::test]
    async fn test_publish_then_subscribe_buffers() {
        let bus = InMemoryBus::new();

        bus.publish("greetings", b"early bird").await.unwrap();
        let mut sub = bus.subscribe("greetings").await.unwrap();

        assert_eq!(sub.next().await.unwrap(), b"early bird");
    }

    #[tokio::test]
    async fn test_per_topic_fifo() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("stream").await.unwrap();

        for i in 0u8..5 {
            bus.publish("stream", &[i]).await.unwrap();
        }
        for i in 0u8..5 {
            assert_eq!(sub.next().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("a").await.unwrap();
        let mut b = bus.subscribe("b").await.unwrap();

        bus.publish("b", b"for b").await.unwrap();
        bus.publish("a", b"for a").await.unwrap();

        assert_eq!(a.next().await.unwrap(), b"for a");
        assert_eq!(b.next().await.unwrap(), b"for b");
    }

    #[tokio::test]
    async fn test_single_consumer_per_topic() {
        let bus = InMemoryBus::new();
        let _sub = bus.subscribe("solo").await.unwrap();

        assert!(bus.subscribe("solo").await.is_err());
    }

    #[tokio::test]
    async fn test_publish_survives_dropped_consumer() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("flaky").await.unwrap();
        drop(sub);

        // Must not error; the bus re-parks a queue for the topic
        bus.publish("flaky", b"still flowing").await.unwrap();
    }
}
