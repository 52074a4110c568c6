//! ChaCha20-Poly1305 AEAD Encryption
//!
//! Authenticated encryption for application messages. The nonce is
//! generated here but returned to the caller, because the message
//! envelope carries it as an explicit field.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use super::error::{CryptoError, CryptoResult};

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric cipher for encryption/decryption
pub struct Cipher;

impl Cipher {
    /// Encrypt plaintext with associated data under a fresh random nonce
    ///
    /// AAD is authenticated but not encrypted (e.g., envelope headers).
    /// Returns `(ciphertext || tag, nonce)`.
    pub fn seal(
        key: &[u8; KEY_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> (Vec<u8>, [u8; NONCE_SIZE]) {
        let cipher = ChaCha20Poly1305::new(key.into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let payload = Payload {
            msg: plaintext,
            aad,
        };

        // Encryption cannot fail with a valid key and nonce
        let ciphertext = cipher
            .encrypt(nonce, payload)
            .expect("encryption should never fail with valid inputs");

        (ciphertext, nonce_bytes)
    }

    /// Decrypt `ciphertext || tag` with associated data
    ///
    /// The AAD must match what was used during encryption.
    pub fn open(
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = ChaCha20Poly1305::new(key.into());
        let nonce = Nonce::from_slice(nonce);

        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        cipher
            .decrypt(nonce, payload)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [42u8; KEY_SIZE];
        let plaintext = b"Hello, peer!";

        let (ciphertext, nonce) = Cipher::seal(&key, plaintext, &[]);
        let decrypted = Cipher::open(&key, &nonce, &ciphertext, &[]).unwrap();

        assert_eq!(plaintext, decrypted.as_slice());
    }

    #[test]
    fn test_ciphertext_different_each_time() {
        let key = [42u8; KEY_SIZE];
        let plaintext = b"Hello";

        let (ct1, n1) = Cipher::seal(&key, plaintext, &[]);
        let (ct2, n2) = Cipher::seal(&key, plaintext, &[]);

        // Different nonces mean different ciphertexts
        assert_ne!(n1, n2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = [1u8; KEY_SIZE];
        let key2 = [2u8; KEY_SIZE];

        let (ciphertext, nonce) = Cipher::seal(&key1, b"Secret", &[]);
        assert!(Cipher::open(&key2, &nonce, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_SIZE];

        let (mut ciphertext, nonce) = Cipher::seal(&key, b"Hello", &[]);
        ciphertext[0] ^= 0xFF;

        assert!(Cipher::open(&key, &nonce, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_aad_must_match() {
        let key = [42u8; KEY_SIZE];
        let aad = b"envelope header";

        let (ciphertext, nonce) = Cipher::seal(&key, b"Secret data", aad);

        assert!(Cipher::open(&key, &nonce, &ciphertext, aad).is_ok());
        assert!(Cipher::open(&key, &nonce, &ciphertext, b"wrong").is_err());
        assert!(Cipher::open(&key, &nonce, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [42u8; KEY_SIZE];

        let (ciphertext, nonce) = Cipher::seal(&key, b"", &[]);
        let decrypted = Cipher::open(&key, &nonce, &ciphertext, &[]).unwrap();

        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = [42u8; KEY_SIZE];
        let nonce = [0u8; NONCE_SIZE];

        assert!(Cipher::open(&key, &nonce, &[0u8; TAG_SIZE - 1], &[]).is_err());
    }
}
