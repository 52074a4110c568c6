//! HKDF-SHA256 key derivation and the shared salt sequence
//!
//! Every chain and message key in the protocol comes out of
//! [`derive`]. The salt input is produced by a [`SaltSequence`]: a
//! public, monotonically advancing `(seed, counter)` pair. The seed is
//! shared initialization input - it adds no secrecy, it only
//! domain-separates derivations between deployments - while the counter
//! keeps the two peers' derivations aligned step for step.

use hkdf::Hkdf;
use sha2::Sha256;

/// Size of every derived key in bytes
pub const DERIVED_KEY_SIZE: usize = 32;

/// Size of a salt value in bytes
pub const SALT_SIZE: usize = 16;

/// Public seed used when no deployment-specific one is configured
pub const SHARED_SALT_SEED: u64 = 0x6261_636b_6368_616e;

/// Derive a 32-byte key from input key material
pub fn derive(salt: &[u8], ikm: &[u8], info: &[u8]) -> [u8; DERIVED_KEY_SIZE] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; DERIVED_KEY_SIZE];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// A monotonically advancing salt generator
///
/// Both peers of a conversation construct one from the same public seed
/// and advance it once per ratchet step (DH or symmetric). In-order
/// delivery keeps the two copies in lockstep, so every derivation sees
/// the same salt on both sides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaltSequence {
    seed: u64,
    counter: u64,
}

impl SaltSequence {
    /// Create a sequence from a public seed, counter at zero
    pub fn new(seed: u64) -> Self {
        SaltSequence { seed, counter: 0 }
    }

    /// Advance the sequence and return the next salt
    pub fn advance(&mut self) -> [u8; SALT_SIZE] {
        self.counter += 1;
        let mut salt = [0u8; SALT_SIZE];
        salt[..8].copy_from_slice(&self.seed.to_le_bytes());
        salt[8..].copy_from_slice(&self.counter.to_le_bytes());
        salt
    }

    /// Number of salts handed out so far
    pub fn counter(&self) -> u64 {
        self.counter
    }
}
