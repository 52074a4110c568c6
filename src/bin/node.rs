//! Interactive backchannel chat node
//!
//! Registers an identity derived from a phone number, prints the local
//! contact list, and opens an end-to-end encrypted chat with the
//! contact whose name is typed. Once a chat is up, every input line is
//! sent to the current peer; `exit()` shuts the device down.
//!
//! Usage:
//!   backchannel-node --phone +15550100 \
//!       --contact bob=+15550101 --contact carol=+15550102 \
//!       [--broker ws://127.0.0.1:8790]

use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

use backchannel::bundle::derive_node_id;
use backchannel::node::NodeError;
use backchannel::transport::WebSocketBus;
use backchannel::{Node, NodeEvent};

/// Interactive backchannel chat node
#[derive(Parser)]
#[command(name = "backchannel-node")]
#[command(about = "End-to-end encrypted chat node")]
struct Args {
    /// Broker WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8790")]
    broker: String,

    /// Phone number this device's identity is derived from
    #[arg(long)]
    phone: String,

    /// Contact entry as name=phone; repeat per contact
    #[arg(long = "contact", value_parser = parse_contact)]
    contacts: Vec<(String, String)>,
}

fn parse_contact(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, phone)) if !name.is_empty() && !phone.is_empty() => {
            Ok((name.to_string(), phone.to_string()))
        }
        _ => Err(format!("expected name=phone, got {s:?}")),
    }
}

fn print_contacts(contacts: &HashMap<String, String>) {
    let mut lines: Vec<String> = contacts
        .iter()
        .map(|(name, id)| format!("{name}: {id}"))
        .collect();
    lines.sort();

    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0);
    let rule = "#".repeat(width + 4);

    println!("\nContact list:");
    println!("{rule}");
    for line in &lines {
        println!("# {line:<width$} #");
    }
    println!("{rule}");
    println!("Enter the name of the contact you want to open a chat with:");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let contacts: HashMap<String, String> = args
        .contacts
        .into_iter()
        .map(|(name, phone)| (name, derive_node_id(&phone)))
        .collect();

    let bus = WebSocketBus::connect(&args.broker)
        .await
        .expect("cannot reach the broker");
    let (node, mut events) = Node::start(Arc::new(bus), &args.phone, contacts)
        .await
        .expect("cannot start the node");

    print_contacts(node.contacts());

    let mut current_peer: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    NodeEvent::SessionEstablished { peer_id, .. } => {
                        let name = node.contact_name(&peer_id).unwrap_or(peer_id.as_str());
                        println!("Chat with {name} initialized. Type to send.");
                        if current_peer.is_none() {
                            current_peer = Some(peer_id);
                        }
                    }
                    NodeEvent::MessageReceived { peer_id, text } => {
                        let name = node.contact_name(&peer_id).unwrap_or(peer_id.as_str());
                        println!("[{name}] >> {text}");
                    }
                    NodeEvent::PeerNotRegistered => {
                        println!("Error: your friend is not registered");
                    }
                }
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line.trim().to_string(),
                    _ => break,
                };
                if line.is_empty() {
                    continue;
                }
                if line == "exit()" {
                    break;
                }

                match &current_peer {
                    Some(peer_id) => {
                        match node.send_message(peer_id, &line).await {
                            Ok(()) => println!("[you] >> {line}"),
                            Err(e) => error!("cannot send: {e}"),
                        }
                    }
                    None => {
                        match node.request_chat(&line).await {
                            Ok(()) => {}
                            Err(NodeError::UnknownContact(_)) => {
                                println!("Contact not found, please insert a valid contact name.");
                            }
                            Err(e) => error!("cannot request chat: {e}"),
                        }
                    }
                }
            }
        }
    }

    println!("Shutting down the device...");
}
