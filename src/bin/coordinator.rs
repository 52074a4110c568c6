//! Backchannel coordinator daemon
//!
//! Runs the key-bundle registry against a broker: consumes the shared
//! registration topic and, per registered identity, its request and
//! ephemeral-republish topics.
//!
//! Usage:
//!   backchannel-coordinator [--broker ws://127.0.0.1:8790]

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use backchannel::transport::WebSocketBus;
use backchannel::Coordinator;

/// Backchannel coordinator daemon
#[derive(Parser)]
#[command(name = "backchannel-coordinator")]
#[command(about = "Key-bundle registry and handshake broker")]
struct Args {
    /// Broker WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8790")]
    broker: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coordinator=info".parse().unwrap())
                .add_directive("backchannel=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let bus = WebSocketBus::connect(&args.broker)
        .await
        .expect("cannot reach the broker");
    info!("connected to broker at {}", args.broker);

    let coordinator = Coordinator::new(Arc::new(bus));
    if let Err(e) = coordinator.run().await {
        error!("coordinator stopped: {e}");
    }
}
