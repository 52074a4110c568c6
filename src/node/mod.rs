//! A chat node
//!
//! One node per end-user device. On start it registers its public
//! bundle, then waits on its two coordinator reply topics: a bundle
//! arriving on the requester reply topic starts an initiator handshake,
//! one arriving on the notification topic starts a responder handshake.
//! Established conversations run over per-pair chat topics, one
//! listener task each.
//!
//! Send and receive paths share a conversation's [`Session`] through an
//! `Arc<Mutex<_>>`: only one of encrypt/decrypt runs at a time for a
//! given peer. Protocol errors on a listener are logged and the loop
//! keeps consuming; nothing here tears a listener down short of the
//! subscription ending.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::bundle::{Identity, PublicBundle, Redaction};
use crate::coordinator::{
    ephemeral_update_topic, initiator_reply_topic, request_topic, responder_reply_topic,
    BundleReply, REGISTER_TOPIC,
};
use crate::handshake::Role;
use crate::session::{MessageEnvelope, Session, SessionError};
use crate::transport::{MessageBus, TransportError};

/// Chat topic carrying envelopes from `from` to `to`
pub fn chat_topic(from: &str, to: &str) -> String {
    format!("{from}_to_{to}")
}

/// Errors surfaced to the node's caller
#[derive(Error, Debug)]
pub enum NodeError {
    /// The name is not in the local contact list
    #[error("contact not found: {0}")]
    UnknownContact(String),

    /// No established conversation with this peer
    #[error("no active chat with {0}")]
    NoActiveChat(String),

    /// The bus failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The session layer failed
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Things the embedding surface (CLI, tests) wants to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A handshake completed and the chat topics are live
    SessionEstablished {
        /// Peer the session talks to
        peer_id: String,
        /// Which side we played
        role: Role,
    },
    /// A message decrypted successfully
    MessageReceived {
        /// Sending peer
        peer_id: String,
        /// Decrypted text
        text: String,
    },
    /// The coordinator answered a request with its not-registered sentinel
    PeerNotRegistered,
}

/// One running chat node
pub struct Node {
    bus: Arc<dyn MessageBus>,
    identity: Mutex<Identity>,
    id: String,
    contacts: HashMap<String, String>,
    conversations: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Node {
    /// Register with the coordinator and start the reply listeners
    ///
    /// `contacts` maps display names to node ids. Returns the node and
    /// the event stream for the embedding surface.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        phone_number: &str,
        contacts: HashMap<String, String>,
    ) -> Result<(Arc<Node>, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let identity = Identity::new(phone_number);
        let id = identity.id().to_string();
        let (events, events_rx) = mpsc::unbounded_channel();

        let node = Arc::new(Node {
            bus,
            identity: Mutex::new(identity),
            id,
            contacts,
            conversations: Mutex::new(HashMap::new()),
            events,
        });

        let bundle = node
            .identity
            .lock()
            .await
            .public_bundle()
            .serialize(&Redaction::none());
        node.bus.publish(REGISTER_TOPIC, &bundle).await?;
        info!(id = %node.id, "registered with coordinator");

        tokio::spawn(listen_initiator_replies(node.clone()));
        tokio::spawn(listen_responder_notifications(node.clone()));

        Ok((node, events_rx))
    }

    /// This node's id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The local contact list, names to ids
    pub fn contacts(&self) -> &HashMap<String, String> {
        &self.contacts
    }

    /// Resolve an id back to a contact name, if we know one
    pub fn contact_name(&self, id: &str) -> Option<&str> {
        self.contacts
            .iter()
            .find(|(_, contact_id)| contact_id.as_str() == id)
            .map(|(name, _)| name.as_str())
    }

    /// Ask the coordinator for a contact's bundle, by display name
    ///
    /// The reply arrives on the requester reply topic and, if it
    /// carries a bundle, starts the initiator handshake.
    pub async fn request_chat(&self, contact_name: &str) -> Result<(), NodeError> {
        let target_id = self
            .contacts
            .get(contact_name)
            .ok_or_else(|| NodeError::UnknownContact(contact_name.to_string()))?;

        info!(target = %target_id, "requesting bundle");
        self.bus
            .publish(&request_topic(&self.id), target_id.as_bytes())
            .await?;
        Ok(())
    }

    /// Encrypt and publish one message to an established conversation
    pub async fn send_message(&self, peer_id: &str, text: &str) -> Result<(), NodeError> {
        let session = self
            .conversations
            .lock()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| NodeError::NoActiveChat(peer_id.to_string()))?;

        let envelope = session.lock().await.encrypt(text.as_bytes())?;
        self.bus
            .publish(&chat_topic(&self.id, peer_id), &envelope.encode())
            .await?;
        Ok(())
    }

    /// Whether a conversation with this peer is established
    pub async fn has_session(&self, peer_id: &str) -> bool {
        self.conversations.lock().await.contains_key(peer_id)
    }
}

/// Run the handshake for a just-received peer bundle and wire the chat
async fn establish_session(
    node: &Arc<Node>,
    peer: PublicBundle,
    role: Role,
) -> Result<(), NodeError> {
    let peer_id = peer.id.clone();

    let session = {
        let mut identity = node.identity.lock().await;
        let session = Session::establish(&identity, &peer, role)?;

        if role == Role::Initiator {
            // The ephemeral that just went into this handshake is spent.
            // Rotate it and republish so the next handshake can target us.
            let fresh = identity.generate_ephemeral();
            let partial = PublicBundle {
                id: node.id.clone(),
                identity: None,
                signed_prekey: None,
                ephemeral: Some(fresh),
            };
            node.bus
                .publish(
                    &ephemeral_update_topic(&node.id),
                    &partial.serialize(&Redaction::none()),
                )
                .await?;
        }
        session
    };

    let first_with_peer = {
        let mut conversations = node.conversations.lock().await;
        conversations
            .insert(peer_id.clone(), Arc::new(Mutex::new(session)))
            .is_none()
    };
    if first_with_peer {
        tokio::spawn(listen_chat(node.clone(), peer_id.clone()));
    }

    info!(peer = %peer_id, ?role, "session established");
    let _ = node.events.send(NodeEvent::SessionEstablished { peer_id, role });
    Ok(())
}

/// Consume the requester reply topic: bundles make us the initiator
async fn listen_initiator_replies(node: Arc<Node>) {
    let topic = initiator_reply_topic(&node.id);
    let mut sub = match node.bus.subscribe(&topic).await {
        Ok(sub) => sub,
        Err(e) => {
            error!(%topic, "cannot listen for bundle replies: {e}");
            return;
        }
    };

    while let Some(bytes) = sub.next().await {
        match BundleReply::decode(&bytes) {
            Ok(BundleReply::Bundle(peer)) => {
                if let Err(e) = establish_session(&node, peer, Role::Initiator).await {
                    error!("initiator handshake failed: {e}");
                }
            }
            Ok(BundleReply::NotRegistered) => {
                error!("requested contact is not registered with the coordinator");
                let _ = node.events.send(NodeEvent::PeerNotRegistered);
            }
            Err(e) => error!("discarding malformed bundle reply: {e}"),
        }
    }
}

/// Consume the notification topic: bundles make us the responder
async fn listen_responder_notifications(node: Arc<Node>) {
    let topic = responder_reply_topic(&node.id);
    let mut sub = match node.bus.subscribe(&topic).await {
        Ok(sub) => sub,
        Err(e) => {
            error!(%topic, "cannot listen for handshake notifications: {e}");
            return;
        }
    };

    while let Some(bytes) = sub.next().await {
        match PublicBundle::deserialize(&bytes) {
            Ok(peer) => {
                if let Err(e) = establish_session(&node, peer, Role::Responder).await {
                    error!("responder handshake failed: {e}");
                }
            }
            Err(e) => error!("discarding malformed handshake notification: {e}"),
        }
    }
}

/// Consume one peer's chat topic for the lifetime of the conversation
///
/// The session is looked up per envelope so a re-established
/// conversation transparently switches the listener to the new state.
async fn listen_chat(node: Arc<Node>, peer_id: String) {
    let topic = chat_topic(&peer_id, &node.id);
    let mut sub = match node.bus.subscribe(&topic).await {
        Ok(sub) => sub,
        Err(e) => {
            error!(%topic, "cannot listen for chat messages: {e}");
            return;
        }
    };

    while let Some(bytes) = sub.next().await {
        let envelope = match MessageEnvelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(peer = %peer_id, "discarding undecodable envelope: {e}");
                continue;
            }
        };

        let session = node.conversations.lock().await.get(&peer_id).cloned();
        let Some(session) = session else {
            warn!(peer = %peer_id, "envelope for a conversation we no longer hold");
            continue;
        };

        let plaintext = match session.lock().await.decrypt(&envelope) {
            Ok(plaintext) => plaintext,
            Err(e @ SessionError::DecryptionFailed) => {
                // Fatal to this message only; the chain took its step and
                // the next in-order envelope still decrypts.
                error!(peer = %peer_id, "message dropped: {e}");
                continue;
            }
            Err(e) => {
                error!(peer = %peer_id, "cannot decrypt: {e}");
                continue;
            }
        };

        let text = String::from_utf8_lossy(&plaintext).into_owned();
        let _ = node.events.send(NodeEvent::MessageReceived {
            peer_id: peer_id.clone(),
            text,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::derive_node_id;
    use crate::coordinator::Coordinator;
    use crate::transport::memory::InMemoryBus;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<NodeEvent>) -> NodeEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a node event")
            .expect("event stream closed")
    }

    fn contacts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, phone)| (name.to_string(), derive_node_id(phone)))
            .collect()
    }

    async fn start_stack() -> InMemoryBus {
        let bus = InMemoryBus::new();
        let coordinator = Coordinator::new(Arc::new(bus.clone()));
        tokio::spawn(async move { coordinator.run().await });
        bus
    }

    #[tokio::test]
    async fn test_end_to_end_chat() {
        let bus = start_stack().await;

        let (alice, mut alice_events) = Node::start(
            Arc::new(bus.clone()),
            "+15550100",
            contacts(&[("bob", "+15550101")]),
        )
        .await
        .unwrap();
        let (bob, mut bob_events) = Node::start(
            Arc::new(bus.clone()),
            "+15550101",
            contacts(&[("alice", "+15550100")]),
        )
        .await
        .unwrap();

        bob.request_chat("alice").await.unwrap();

        assert_eq!(
            next_event(&mut bob_events).await,
            NodeEvent::SessionEstablished {
                peer_id: alice.id().to_string(),
                role: Role::Initiator,
            }
        );
        assert_eq!(
            next_event(&mut alice_events).await,
            NodeEvent::SessionEstablished {
                peer_id: bob.id().to_string(),
                role: Role::Responder,
            }
        );

        // The initiator speaks first
        bob.send_message(alice.id(), "Hello A").await.unwrap();
        assert_eq!(
            next_event(&mut alice_events).await,
            NodeEvent::MessageReceived {
                peer_id: bob.id().to_string(),
                text: "Hello A".to_string(),
            }
        );

        alice.send_message(bob.id(), "Hi B").await.unwrap();
        assert_eq!(
            next_event(&mut bob_events).await,
            NodeEvent::MessageReceived {
                peer_id: alice.id().to_string(),
                text: "Hi B".to_string(),
            }
        );

        // And changes direction once more
        bob.send_message(alice.id(), "How is it going?").await.unwrap();
        assert_eq!(
            next_event(&mut alice_events).await,
            NodeEvent::MessageReceived {
                peer_id: bob.id().to_string(),
                text: "How is it going?".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_contact_is_rejected() {
        let bus = start_stack().await;
        let (node, _events) = Node::start(Arc::new(bus), "+15550100", HashMap::new())
            .await
            .unwrap();

        assert!(matches!(
            node.request_chat("stranger").await,
            Err(NodeError::UnknownContact(_))
        ));
    }

    #[tokio::test]
    async fn test_not_registered_creates_no_session() {
        let bus = start_stack().await;

        let (node, mut events) = Node::start(
            Arc::new(bus),
            "+15550100",
            contacts(&[("zed", "+15559999")]),
        )
        .await
        .unwrap();

        node.request_chat("zed").await.unwrap();

        assert_eq!(next_event(&mut events).await, NodeEvent::PeerNotRegistered);
        assert!(!node.has_session(&derive_node_id("+15559999")).await);
    }
}
