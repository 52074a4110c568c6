//! X3DH-style key agreement
//!
//! Three DH operations over long-term, medium-term and ephemeral key
//! material, combined in a fixed order and fed through the KDF, give
//! both peers the same 32-byte master secret from asymmetric inputs:
//!
//! ```text
//! initiator                         responder
//! ---------                         ---------
//! identity  x peer signed-prekey == signed-prekey x peer identity
//! ephemeral x peer identity      == identity      x peer ephemeral
//! ephemeral x peer signed-prekey == signed-prekey x peer ephemeral
//! ```
//!
//! The initiator additionally checks the signature over the peer's
//! signed prekey before performing any DH. The responder cannot: its
//! view of the peer bundle has the prekey redacted by the coordinator.

use thiserror::Error;
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::bundle::{Identity, PublicBundle};
use crate::crypto::{kdf, SharedSecret};

/// Size of the derived master secret in bytes
pub const MASTER_SECRET_SIZE: usize = 32;

const X3DH_INFO: &[u8] = b"backchannel x3dh v1";

/// Which side of the handshake a node plays
///
/// Assigned by the coordinator's reply topic: a bundle arriving on the
/// requester's reply topic makes that node the initiator, one arriving
/// on the target's notification topic makes it the responder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The node that requested the peer's bundle
    Initiator,
    /// The node whose bundle was requested
    Responder,
}

/// Errors from the key-agreement handshake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The peer bundle is missing a key this role's DH set requires
    #[error("peer bundle is missing its {0} key")]
    IncompleteBundle(&'static str),

    /// Our own ephemeral key material is missing
    #[error("own ephemeral key material is missing")]
    MissingOwnEphemeral,

    /// The signature over the peer's signed prekey did not verify
    #[error("signed prekey signature did not verify")]
    BadPrekeySignature,
}

/// The shared 32-byte secret both peers derive after the handshake
///
/// Never serialized or transmitted; consumed immediately to seed the
/// ratchet. Zeroized on drop.
#[derive(ZeroizeOnDrop, PartialEq)]
pub struct MasterSecret([u8; MASTER_SECRET_SIZE]);

impl MasterSecret {
    pub(crate) fn as_bytes(&self) -> &[u8; MASTER_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterSecret(..)")
    }
}

/// Derive the master secret as the initiator
///
/// Requires the peer's identity and signed prekey. The initiator's own
/// ephemeral is the one whose public key the coordinator handed to the
/// peer, so it must still be the current one when this runs.
pub fn compute_initiator_secret(
    own: &Identity,
    peer: &PublicBundle,
) -> Result<MasterSecret, HandshakeError> {
    let peer_identity = peer
        .identity
        .as_ref()
        .ok_or(HandshakeError::IncompleteBundle("identity"))?;
    let peer_prekey = peer
        .signed_prekey
        .as_ref()
        .ok_or(HandshakeError::IncompleteBundle("signed prekey"))?;

    peer_identity
        .verify
        .verify(peer_prekey.key.as_bytes(), &peer_prekey.signature)
        .map_err(|_| HandshakeError::BadPrekeySignature)?;

    let own_ephemeral = own
        .ephemeral_keypair()
        .ok_or(HandshakeError::MissingOwnEphemeral)?;

    let dh1 = own.identity_keypair().diffie_hellman(&peer_prekey.key);
    let dh2 = own_ephemeral.diffie_hellman(&peer_identity.exchange);
    let dh3 = own_ephemeral.diffie_hellman(&peer_prekey.key);

    Ok(combine(&dh1, &dh2, &dh3))
}

/// Derive the master secret as the responder
///
/// Requires the peer's identity and ephemeral; by commutativity the
/// swapped pairings below produce the initiator's exact secret.
pub fn compute_responder_secret(
    own: &Identity,
    peer: &PublicBundle,
) -> Result<MasterSecret, HandshakeError> {
    let peer_identity = peer
        .identity
        .as_ref()
        .ok_or(HandshakeError::IncompleteBundle("identity"))?;
    let peer_ephemeral = peer
        .ephemeral
        .as_ref()
        .ok_or(HandshakeError::IncompleteBundle("ephemeral"))?;

    let dh1 = own.signed_prekey_pair().diffie_hellman(&peer_identity.exchange);
    let dh2 = own.identity_keypair().diffie_hellman(peer_ephemeral);
    let dh3 = own.signed_prekey_pair().diffie_hellman(peer_ephemeral);

    Ok(combine(&dh1, &dh2, &dh3))
}

fn combine(dh1: &SharedSecret, dh2: &SharedSecret, dh3: &SharedSecret) -> MasterSecret {
    let mut ikm = Zeroizing::new([0u8; 96]);
    ikm[..32].copy_from_slice(dh1.as_bytes());
    ikm[32..64].copy_from_slice(dh2.as_bytes());
    ikm[64..].copy_from_slice(dh3.as_bytes());

    MasterSecret(kdf::derive(&[], ikm.as_slice(), X3DH_INFO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Redaction;

    /// The two bundle views the coordinator actually produces: the
    /// initiator sees the responder without an ephemeral, the responder
    /// sees the initiator without a prekey.
    fn coordinator_views(
        initiator: &Identity,
        responder: &Identity,
    ) -> (PublicBundle, PublicBundle) {
        let responder_view_of_initiator = PublicBundle::deserialize(
            &initiator
                .public_bundle()
                .serialize(&Redaction::none().without_signed_prekey()),
        )
        .unwrap();
        let initiator_view_of_responder = PublicBundle::deserialize(
            &responder
                .public_bundle()
                .serialize(&Redaction::none().without_ephemeral()),
        )
        .unwrap();
        (initiator_view_of_responder, responder_view_of_initiator)
    }

    #[test]
    fn test_both_roles_derive_equal_secret() {
        let alice = Identity::new("+15550100");
        let bob = Identity::new("+15550101");

        let (bob_view, alice_view) = coordinator_views(&alice, &bob);

        let initiator_secret = compute_initiator_secret(&alice, &bob_view).unwrap();
        let responder_secret = compute_responder_secret(&bob, &alice_view).unwrap();

        assert_eq!(initiator_secret.as_bytes(), responder_secret.as_bytes());
    }

    #[test]
    fn test_different_pairs_different_secrets() {
        let alice = Identity::new("+15550100");
        let bob = Identity::new("+15550101");
        let carol = Identity::new("+15550102");

        let s1 = compute_initiator_secret(&alice, &bob.public_bundle()).unwrap();
        let s2 = compute_initiator_secret(&alice, &carol.public_bundle()).unwrap();

        assert_ne!(s1.as_bytes(), s2.as_bytes());
    }

    #[test]
    fn test_initiator_rejects_missing_prekey() {
        let alice = Identity::new("+15550100");
        let bob = Identity::new("+15550101");

        let mut view = bob.public_bundle();
        view.signed_prekey = None;

        assert_eq!(
            compute_initiator_secret(&alice, &view),
            Err(HandshakeError::IncompleteBundle("signed prekey"))
        );
    }

    #[test]
    fn test_initiator_rejects_missing_identity() {
        let alice = Identity::new("+15550100");
        let bob = Identity::new("+15550101");

        let mut view = bob.public_bundle();
        view.identity = None;

        assert_eq!(
            compute_initiator_secret(&alice, &view),
            Err(HandshakeError::IncompleteBundle("identity"))
        );
    }

    #[test]
    fn test_responder_rejects_missing_ephemeral() {
        let alice = Identity::new("+15550100");
        let bob = Identity::new("+15550101");

        let mut view = alice.public_bundle();
        view.ephemeral = None;

        assert_eq!(
            compute_responder_secret(&bob, &view),
            Err(HandshakeError::IncompleteBundle("ephemeral"))
        );
    }

    #[test]
    fn test_initiator_rejects_forged_prekey() {
        let alice = Identity::new("+15550100");
        let bob = Identity::new("+15550101");
        let mallory = Identity::new("+15550666");

        // Splice Mallory's prekey into Bob's bundle
        let mut view = bob.public_bundle();
        view.signed_prekey = mallory.public_bundle().signed_prekey;

        assert_eq!(
            compute_initiator_secret(&alice, &view),
            Err(HandshakeError::BadPrekeySignature)
        );
    }
}
