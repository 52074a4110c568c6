//! Coordinator registry and bundle distribution
//!
//! The coordinator is semi-trusted: it stores one public bundle per
//! registered identity and brokers the initial handoff, but it never
//! sees session keys or plaintext. Per registered identity it consumes
//! two topics, the bundle-request topic and the ephemeral-republish
//! topic; one more shared topic accepts registrations.
//!
//! The handoff gives each side exactly the keys its handshake role
//! needs: the requester (initiator) gets the target's bundle without
//! the ephemeral, the target (responder) gets the requester's bundle
//! without the signed prekey. The requester's stored ephemeral is
//! cleared afterwards - it has been consumed - and comes back only
//! through the initiator's republish.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::bundle::{BundleError, PublicBundle, Redaction};
use crate::transport::{MessageBus, TransportError};

/// Shared topic on which nodes register their bundles
pub const REGISTER_TOPIC: &str = "register";

/// Topic on which `id` asks for a contact's bundle
pub fn request_topic(id: &str) -> String {
    format!("{id}_req_pub")
}

/// Topic on which `id`, as requester, receives the target's bundle
pub fn initiator_reply_topic(id: &str) -> String {
    format!("{id}_rep_init_pub")
}

/// Topic on which `id`, as target, is notified of a pending handshake
pub fn responder_reply_topic(id: &str) -> String {
    format!("{id}_rep_resp_pub")
}

/// Topic on which `id` republishes its fresh ephemeral key
pub fn ephemeral_update_topic(id: &str) -> String {
    format!("{id}_update_initiator_epk")
}

const REPLY_BUNDLE: u8 = 0x01;
const REPLY_NOT_REGISTERED: u8 = 0x02;

/// Reply sent to a requester: the target's bundle, or a sentinel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BundleReply {
    /// The target's bundle, redacted for the initiator role
    Bundle(PublicBundle),
    /// The requested id is not registered
    NotRegistered,
}

impl BundleReply {
    /// Encode the reply, applying `redact` to a carried bundle
    pub fn encode(&self, redact: &Redaction) -> Vec<u8> {
        match self {
            BundleReply::Bundle(bundle) => {
                let mut bytes = vec![REPLY_BUNDLE];
                bytes.extend_from_slice(&bundle.serialize(redact));
                bytes
            }
            BundleReply::NotRegistered => vec![REPLY_NOT_REGISTERED],
        }
    }

    /// Inverse of [`encode`](Self::encode)
    pub fn decode(bytes: &[u8]) -> Result<Self, BundleError> {
        match bytes.split_first() {
            Some((&REPLY_BUNDLE, rest)) => {
                Ok(BundleReply::Bundle(PublicBundle::deserialize(rest)?))
            }
            Some((&REPLY_NOT_REGISTERED, [])) => Ok(BundleReply::NotRegistered),
            Some(_) => Err(BundleError::MalformedBundle("unknown reply tag")),
            None => Err(BundleError::MalformedBundle("truncated")),
        }
    }
}

/// One registry entry: the stored public bundle
///
/// The entry's topic subscriptions live as listener tasks spawned at
/// registration; entries are never deleted.
struct RegisteredUser {
    bundle: PublicBundle,
}

type Registry = Arc<RwLock<HashMap<String, RegisteredUser>>>;

/// Errors that abort the coordinator's main loop
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The bus went away
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The coordinator service
pub struct Coordinator {
    bus: Arc<dyn MessageBus>,
    registry: Registry,
}

impl Coordinator {
    /// Create a coordinator on a bus
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Coordinator {
            bus,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Consume the registration topic forever
    ///
    /// Returns only when the registration subscription cannot be opened
    /// or ends. Malformed registrations are logged and skipped; the
    /// loop keeps accepting subsequent messages.
    pub async fn run(&self) -> Result<(), CoordinatorError> {
        let mut registrations = self.bus.subscribe(REGISTER_TOPIC).await?;
        info!("waiting for registrations on {REGISTER_TOPIC}");

        while let Some(bytes) = registrations.next().await {
            match PublicBundle::deserialize(&bytes) {
                Ok(bundle) => self.register(bundle).await,
                Err(e) => warn!("discarding malformed registration: {e}"),
            }
        }
        Ok(())
    }

    /// Insert or replace a registry entry
    ///
    /// Re-registering an id deliberately overwrites the stored bundle;
    /// the listeners for its topics are already running and are not
    /// duplicated.
    async fn register(&self, bundle: PublicBundle) {
        let id = bundle.id.clone();
        let mut registry = self.registry.write().await;
        let previous = registry.insert(id.clone(), RegisteredUser { bundle });
        drop(registry);

        if previous.is_some() {
            info!(%id, "re-registration; stored bundle replaced");
            return;
        }
        info!(%id, "registered");

        tokio::spawn(serve_requests(
            self.bus.clone(),
            self.registry.clone(),
            id.clone(),
        ));
        tokio::spawn(watch_ephemeral_updates(
            self.bus.clone(),
            self.registry.clone(),
            id,
        ));
    }
}

/// Consume `<id>_req_pub`, answering each bundle request
async fn serve_requests(bus: Arc<dyn MessageBus>, registry: Registry, requester_id: String) {
    let topic = request_topic(&requester_id);
    let mut sub = match bus.subscribe(&topic).await {
        Ok(sub) => sub,
        Err(e) => {
            error!(%topic, "cannot serve requests: {e}");
            return;
        }
    };

    while let Some(bytes) = sub.next().await {
        let target_id = match String::from_utf8(bytes) {
            Ok(id) => id,
            Err(_) => {
                warn!(requester = %requester_id, "discarding non-utf8 request");
                continue;
            }
        };
        handle_request(&bus, &registry, &requester_id, target_id.trim()).await;
    }
}

/// Answer one bundle request
async fn handle_request(
    bus: &Arc<dyn MessageBus>,
    registry: &Registry,
    requester_id: &str,
    target_id: &str,
) {
    info!(requester = requester_id, target = target_id, "bundle requested");
    let mut registry = registry.write().await;

    let target_bundle = registry.get(target_id).map(|user| user.bundle.clone());
    match target_bundle {
        Some(target_bundle) => {
            // Notify the target: the requester's bundle, prekey redacted,
            // ephemeral included - the responder's DH set needs exactly that.
            if let Some(requester) = registry.get(requester_id) {
                let notification = requester
                    .bundle
                    .serialize(&Redaction::none().without_signed_prekey());
                if let Err(e) = bus
                    .publish(&responder_reply_topic(target_id), &notification)
                    .await
                {
                    error!(target = target_id, "cannot notify responder: {e}");
                }
            } else {
                warn!(requester = requester_id, "request from unregistered id");
            }

            // Answer the requester: the target's bundle without the
            // single-use ephemeral, which is not the initiator's to see.
            let reply = BundleReply::Bundle(target_bundle)
                .encode(&Redaction::none().without_ephemeral());
            if let Err(e) = bus
                .publish(&initiator_reply_topic(requester_id), &reply)
                .await
            {
                error!(requester = requester_id, "cannot answer requester: {e}");
            }
        }
        None => {
            info!(target = target_id, "requested id is not registered");
            let reply = BundleReply::NotRegistered.encode(&Redaction::none());
            if let Err(e) = bus
                .publish(&initiator_reply_topic(requester_id), &reply)
                .await
            {
                error!(requester = requester_id, "cannot answer requester: {e}");
            }
        }
    }

    // Single-use policy: the requester's stored ephemeral was consumed by
    // this handoff (or is stale); clear it regardless of outcome.
    if let Some(requester) = registry.get_mut(requester_id) {
        requester.bundle.ephemeral = None;
    }
}

/// Consume `<id>_update_initiator_epk`, merging republished ephemerals
async fn watch_ephemeral_updates(bus: Arc<dyn MessageBus>, registry: Registry, id: String) {
    let topic = ephemeral_update_topic(&id);
    let mut sub = match bus.subscribe(&topic).await {
        Ok(sub) => sub,
        Err(e) => {
            error!(%topic, "cannot watch ephemeral updates: {e}");
            return;
        }
    };

    while let Some(bytes) = sub.next().await {
        let partial = match PublicBundle::deserialize(&bytes) {
            Ok(partial) => partial,
            Err(e) => {
                warn!(%id, "discarding malformed ephemeral update: {e}");
                continue;
            }
        };
        if partial.id != id {
            warn!(%id, claimed = %partial.id, "update for a foreign id ignored");
            continue;
        }

        match registry.write().await.get_mut(&id) {
            Some(user) => {
                user.bundle.merge(partial);
                info!(%id, "ephemeral key republished");
            }
            None => warn!(%id, "update for an unknown id"),
        }
    }
}
