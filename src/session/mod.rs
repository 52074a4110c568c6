//! Per-conversation session state
//!
//! A [`Session`] binds one peer to one ratchet: it runs the role-tagged
//! handshake, seeds the ratchet from the resulting master secret and
//! then turns plaintext into envelopes and back. Send and receive
//! listeners share a session through `Arc<Mutex<Session>>`; every state
//! transition happens under that lock.

mod envelope;
mod ratchet;

pub use envelope::MessageEnvelope;
pub use ratchet::{DhAdvance, Ratchet, RatchetDirection};

use thiserror::Error;

use crate::bundle::{Identity, PublicBundle};
use crate::handshake::{
    compute_initiator_secret, compute_responder_secret, HandshakeError, Role,
};

/// Errors from session establishment and the ratchet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The key-agreement handshake failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The bytes are not a valid envelope serialization
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    /// Authentication tag mismatch; fatal to this message only
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// Cannot rotate the sending chain before a peer ratchet key is known
    #[error("no peer ratchet key known yet")]
    NoPeerRatchetKey,

    /// No own ratchet key available for this operation
    #[error("no own ratchet key available")]
    NoOwnRatchetKey,
}

/// One end of an established conversation
pub struct Session {
    peer_id: String,
    role: Role,
    ratchet: Ratchet,
}

impl Session {
    /// Run the handshake for `role` against a peer bundle and seed the
    /// ratchet from the derived master secret
    pub fn establish(
        own: &Identity,
        peer: &PublicBundle,
        role: Role,
    ) -> Result<Self, SessionError> {
        let master = match role {
            Role::Initiator => compute_initiator_secret(own, peer)?,
            Role::Responder => compute_responder_secret(own, peer)?,
        };

        let ratchet = Ratchet::seed(
            master,
            role,
            own.signed_prekey_pair(),
            peer.signed_prekey.as_ref().map(|p| &p.key),
        )?;

        Ok(Session {
            peer_id: peer.id.clone(),
            role,
            ratchet,
        })
    }

    /// The peer this session talks to
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Which side of the handshake we played
    pub fn role(&self) -> Role {
        self.role
    }

    /// Encrypt one message for the peer
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<MessageEnvelope, SessionError> {
        self.ratchet.encrypt(plaintext)
    }

    /// Decrypt one message from the peer
    pub fn decrypt(&mut self, envelope: &MessageEnvelope) -> Result<Vec<u8>, SessionError> {
        self.ratchet.decrypt(envelope)
    }

    /// Read-only view of the ratchet state
    pub fn ratchet(&self) -> &Ratchet {
        &self.ratchet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Redaction;

    /// Establish both ends the way the coordinator handoff shapes the
    /// bundle views.
    fn establish_pair() -> (Session, Session) {
        let alice = Identity::new("+15550100");
        let bob = Identity::new("+15550101");

        let bob_view = PublicBundle::deserialize(
            &alice
                .public_bundle()
                .serialize(&Redaction::none().without_signed_prekey()),
        )
        .unwrap();
        let alice_view = PublicBundle::deserialize(
            &bob.public_bundle()
                .serialize(&Redaction::none().without_ephemeral()),
        )
        .unwrap();

        let a = Session::establish(&alice, &alice_view, Role::Initiator).unwrap();
        let b = Session::establish(&bob, &bob_view, Role::Responder).unwrap();
        (a, b)
    }

    #[test]
    fn test_session_conversation() {
        let (mut a, mut b) = establish_pair();

        let envelope = a.encrypt(b"Hello B").unwrap();
        assert_eq!(b.decrypt(&envelope).unwrap(), b"Hello B");

        let envelope = b.encrypt(b"Hi A").unwrap();
        assert_eq!(a.decrypt(&envelope).unwrap(), b"Hi A");

        let envelope = a.encrypt(b"How is it going?").unwrap();
        assert_eq!(b.decrypt(&envelope).unwrap(), b"How is it going?");
    }

    #[test]
    fn test_truncated_envelope_leaves_state_intact() {
        let (mut a, mut b) = establish_pair();

        let bytes = a.encrypt(b"payload").unwrap().encode();
        assert!(matches!(
            MessageEnvelope::decode(&bytes[..bytes.len() - 3]),
            Err(SessionError::MalformedEnvelope(_))
        ));

        // The failed decode took no ratchet step; the intact envelope
        // still decrypts
        let envelope = MessageEnvelope::decode(&bytes).unwrap();
        assert_eq!(b.decrypt(&envelope).unwrap(), b"payload");
    }

    #[test]
    fn test_establish_rejects_incomplete_bundle() {
        let alice = Identity::new("+15550100");
        let bob = Identity::new("+15550101");

        let mut view = bob.public_bundle();
        view.identity = None;

        assert!(matches!(
            Session::establish(&alice, &view, Role::Initiator),
            Err(SessionError::Handshake(HandshakeError::IncompleteBundle(_)))
        ));
    }
}
