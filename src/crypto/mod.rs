//! Cryptographic primitives
//!
//! This module provides all the cryptographic building blocks:
//! - `exchange`: X25519 ECDH for key agreement
//! - `signing`: Ed25519 signatures over the signed prekey
//! - `cipher`: ChaCha20-Poly1305 AEAD encryption
//! - `kdf`: HKDF-SHA256 derivation and the shared salt sequence

pub mod cipher;
pub mod error;
pub mod exchange;
pub mod kdf;
pub mod signing;

// Re-export commonly used types
pub use cipher::Cipher;
pub use error::{CryptoError, CryptoResult};
pub use exchange::{DhKeypair, ExchangePublicKey, SharedSecret};
pub use kdf::SaltSequence;
pub use signing::{SignatureBytes, SigningKeypair, VerifyKey};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_dh_then_encrypt_flow() {
        let alice = DhKeypair::generate();
        let bob = DhKeypair::generate();

        let alice_shared = alice.diffie_hellman(bob.public_key());
        let bob_shared = bob.diffie_hellman(alice.public_key());

        let alice_key = kdf::derive(b"salt", alice_shared.as_bytes(), b"message");
        let bob_key = kdf::derive(b"salt", bob_shared.as_bytes(), b"message");
        assert_eq!(alice_key, bob_key);

        let (ciphertext, nonce) = Cipher::seal(&alice_key, b"Hello, Bob!", &[]);
        let decrypted = Cipher::open(&bob_key, &nonce, &ciphertext, &[]).unwrap();
        assert_eq!(decrypted, b"Hello, Bob!");
    }
}
