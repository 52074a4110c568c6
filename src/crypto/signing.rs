//! Ed25519 prekey signing
//!
//! A node signs its medium-term signed prekey with a long-term Ed25519
//! key, so a handshake initiator can check that the prekey in a fetched
//! bundle really belongs to the claimed identity.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use super::error::{CryptoError, CryptoResult};

/// Size of an Ed25519 verify key in bytes
pub const VERIFY_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// A public key for signature verification
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VerifyKey(pub [u8; VERIFY_KEY_SIZE]);

impl VerifyKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != VERIFY_KEY_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: VERIFY_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; VERIFY_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(VerifyKey(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; VERIFY_KEY_SIZE] {
        &self.0
    }

    /// Verify a signature over a message
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig = Signature::from_bytes(&signature.0);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for VerifyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerifyKey({}...)", &hex::encode(self.0)[..16])
    }
}

/// A signature produced by a signing keypair
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

impl SignatureBytes {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; SIGNATURE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(SignatureBytes(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", &hex::encode(self.0)[..16])
    }
}

/// An Ed25519 signing keypair
///
/// The secret key is zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct SigningKeypair {
    #[zeroize(skip)]
    verify_key: VerifyKey,
    secret_key: [u8; 32],
}

impl SigningKeypair {
    /// Generate a new random signing keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        SigningKeypair {
            verify_key: VerifyKey(verifying_key.to_bytes()),
            secret_key: signing_key.to_bytes(),
        }
    }

    /// Get the verify key
    pub fn verify_key(&self) -> &VerifyKey {
        &self.verify_key
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        let signing_key = SigningKey::from_bytes(&self.secret_key);
        let signature = signing_key.sign(message);
        SignatureBytes(signature.to_bytes())
    }
}

impl Clone for SigningKeypair {
    fn clone(&self) -> Self {
        SigningKeypair {
            verify_key: self.verify_key,
            secret_key: self.secret_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = SigningKeypair::generate();
        let message = b"prekey bytes";

        let signature = keypair.sign(message);
        assert!(keypair.verify_key().verify(message, &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let keypair = SigningKeypair::generate();

        let signature = keypair.sign(b"prekey bytes");
        assert!(keypair
            .verify_key()
            .verify(b"other bytes", &signature)
            .is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let message = b"prekey bytes";

        let signature = keypair.sign(message);
        assert!(other.verify_key().verify(message, &signature).is_err());
    }

    #[test]
    fn test_verify_key_rejects_wrong_length() {
        assert!(VerifyKey::from_bytes(&[0u8; 16]).is_err());
        assert!(SignatureBytes::from_bytes(&[0u8; 63]).is_err());
    }
}
