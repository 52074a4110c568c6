//! Backchannel topic broker
//!
//! A WebSocket broker that routes opaque payloads between flat,
//! globally-addressed topics:
//! - At-least-once, per-topic FIFO delivery
//! - One consumer per topic; payloads published before anyone
//!   subscribes are held back
//! - Zero knowledge: every payload is an opaque blob
//!
//! Usage:
//!   backchannel-broker [--port 8790] [--host 0.0.0.0]

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};

use backchannel::transport::websocket::BrokerFrame;

/// Backchannel topic broker
#[derive(Parser)]
#[command(name = "backchannel-broker")]
#[command(about = "Topic broker for backchannel nodes and coordinator")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8790")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

/// A delivery on its way to a connection: (topic, base64 payload)
type Delivery = (String, String);

struct Topic {
    /// The single consumer, tagged with its connection id
    consumer: Option<(usize, mpsc::UnboundedSender<Delivery>)>,
    /// Payloads held back until a consumer appears
    backlog: Vec<String>,
}

struct BrokerState {
    topics: RwLock<HashMap<String, Topic>>,
}

impl BrokerState {
    fn new() -> Self {
        BrokerState {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Make `consumer` the topic's consumer and flush the backlog to it
    async fn subscribe(
        &self,
        topic: &str,
        client_id: usize,
        consumer: mpsc::UnboundedSender<Delivery>,
    ) {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            consumer: None,
            backlog: Vec::new(),
        });

        for payload in entry.backlog.drain(..) {
            let _ = consumer.send((topic.to_string(), payload));
        }
        entry.consumer = Some((client_id, consumer));
    }

    /// Route a payload to the topic's consumer, or hold it back
    async fn publish(&self, topic: &str, payload: String) {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            consumer: None,
            backlog: Vec::new(),
        });

        match &entry.consumer {
            Some((_, consumer)) if consumer.send((topic.to_string(), payload.clone())).is_ok() => {}
            _ => {
                entry.consumer = None;
                entry.backlog.push(payload);
            }
        }
    }

    /// Drop every subscription a disconnected client held
    async fn forget_client(&self, client_id: usize) {
        let mut topics = self.topics.write().await;
        for entry in topics.values_mut() {
            if matches!(entry.consumer, Some((id, _)) if id == client_id) {
                entry.consumer = None;
            }
        }
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<BrokerState>) {
    info!("New connection from: {}", addr);

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (deliveries_tx, mut deliveries) = mpsc::unbounded_channel::<Delivery>();
    let client_id: usize = rand::random();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BrokerFrame>(&text) {
                            Ok(BrokerFrame::Subscribe { topic }) => {
                                info!(client = client_id, %topic, "subscribed");
                                state.subscribe(&topic, client_id, deliveries_tx.clone()).await;
                            }
                            Ok(BrokerFrame::Publish { topic, payload }) => {
                                state.publish(&topic, payload).await;
                            }
                            Ok(BrokerFrame::Ping) => {
                                if let Ok(json) = serde_json::to_string(&BrokerFrame::Pong) {
                                    let _ = write.send(Message::Text(json)).await;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("Invalid frame from {}: {}", addr, e);
                                let reply = BrokerFrame::Error {
                                    message: format!("invalid frame: {e}"),
                                };
                                if let Ok(json) = serde_json::to_string(&reply) {
                                    let _ = write.send(Message::Text(json)).await;
                                }
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client {} disconnected", addr);
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }

                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }

                    _ => {}
                }
            }

            delivery = deliveries.recv() => {
                if let Some((topic, payload)) = delivery {
                    let frame = BrokerFrame::Deliver { topic, payload };
                    if let Ok(json) = serde_json::to_string(&frame) {
                        let _ = write.send(Message::Text(json)).await;
                    }
                }
            }
        }
    }

    state.forget_client(client_id).await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("broker=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
    info!("Backchannel broker listening on ws://{}", addr);

    let state = Arc::new(BrokerState::new());

    while let Ok((stream, addr)) = listener.accept().await {
        let state = state.clone();
        tokio::spawn(handle_connection(stream, addr, state));
    }
}
