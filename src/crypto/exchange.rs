//! X25519 Key Exchange
//!
//! Elliptic-curve Diffie-Hellman over Curve25519. Every key in the
//! protocol (long-term identity, signed prekey, handshake ephemeral,
//! ratchet key) is an X25519 keypair built on this module.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::error::{CryptoError, CryptoResult};

/// Size of an X25519 public key in bytes
pub const EXCHANGE_KEY_SIZE: usize = 32;

/// Size of a DH shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// A public key for key exchange (X25519)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangePublicKey(pub [u8; EXCHANGE_KEY_SIZE]);

impl ExchangePublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != EXCHANGE_KEY_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: EXCHANGE_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; EXCHANGE_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(ExchangePublicKey(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; EXCHANGE_KEY_SIZE] {
        &self.0
    }

    /// Convert to hex string for display
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for ExchangePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExchangePublicKey({}...)", &self.to_hex()[..16])
    }
}

/// Shared secret derived from a single DH operation
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    secret: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Get the raw bytes (be careful with this!)
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.secret
    }
}

/// An X25519 keypair
///
/// The secret half is zeroized when dropped. One type serves every key
/// role in the protocol; lifetime policy (long-term, medium-term,
/// single-use) is the owner's business.
#[derive(ZeroizeOnDrop)]
pub struct DhKeypair {
    #[zeroize(skip)]
    public: ExchangePublicKey,
    secret: [u8; 32],
}

impl DhKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);

        DhKeypair {
            public: ExchangePublicKey(public.to_bytes()),
            secret: secret.to_bytes(),
        }
    }

    /// Get the public key to share with the peer
    pub fn public_key(&self) -> &ExchangePublicKey {
        &self.public
    }

    /// Compute the shared secret with a peer's public key
    pub fn diffie_hellman(&self, peer_public: &ExchangePublicKey) -> SharedSecret {
        let secret = StaticSecret::from(self.secret);
        let peer = X25519Public::from(peer_public.0);
        let shared = secret.diffie_hellman(&peer);

        SharedSecret {
            secret: shared.to_bytes(),
        }
    }
}

impl Clone for DhKeypair {
    fn clone(&self) -> Self {
        DhKeypair {
            public: self.public,
            secret: self.secret,
        }
    }
}

impl std::fmt::Debug for DhKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhKeypair(pub {}...)", &self.public.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_key_exchange() {
        let alice = DhKeypair::generate();
        let bob = DhKeypair::generate();

        let alice_shared = alice.diffie_hellman(bob.public_key());
        let bob_shared = bob.diffie_hellman(alice.public_key());

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_different_keys_different_secrets() {
        let alice = DhKeypair::generate();
        let bob = DhKeypair::generate();
        let carol = DhKeypair::generate();

        let alice_bob = alice.diffie_hellman(bob.public_key());
        let alice_carol = alice.diffie_hellman(carol.public_key());

        assert_ne!(alice_bob.as_bytes(), alice_carol.as_bytes());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let keypair = DhKeypair::generate();
        let hex = keypair.public_key().to_hex();
        let restored = ExchangePublicKey::from_hex(&hex).unwrap();

        assert_eq!(keypair.public_key().0, restored.0);
    }

    #[test]
    fn test_public_key_rejects_wrong_length() {
        assert!(ExchangePublicKey::from_bytes(&[0u8; 31]).is_err());
        assert!(ExchangePublicKey::from_bytes(&[0u8; 33]).is_err());
    }
}
