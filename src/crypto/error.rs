//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key, nonce or signature has an invalid length
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// The public key format is invalid
    #[error("Invalid public key format")]
    InvalidPublicKey,

    /// Signature verification failed - the signature does not match
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Decryption failed - authentication tag mismatch (possibly tampered data)
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
