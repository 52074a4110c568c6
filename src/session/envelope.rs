//! Wire format for one encrypted application message

use crate::crypto::cipher::NONCE_SIZE;
use crate::crypto::exchange::EXCHANGE_KEY_SIZE;
use crate::crypto::ExchangePublicKey;

use super::SessionError;

/// One transmitted application message
///
/// Immutable once constructed. Besides the ciphertext and nonce it
/// carries the sender's current DH ratchet public key, so the receiver
/// can detect a rotation, and the chain counter the sender used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// AEAD output, tag included
    pub ciphertext: Vec<u8>,
    /// Nonce the ciphertext was sealed under
    pub nonce: [u8; NONCE_SIZE],
    /// The sender's DH ratchet public key at send time
    pub sender_ratchet_key: ExchangePublicKey,
    /// The sender's chain counter at send time
    pub counter: u64,
}

impl MessageEnvelope {
    /// Encode as a fixed-order concatenation of length-prefixed fields
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(4 + self.ciphertext.len() + NONCE_SIZE + EXCHANGE_KEY_SIZE + 8);
        bytes.extend_from_slice(&(self.ciphertext.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(self.sender_ratchet_key.as_bytes());
        bytes.extend_from_slice(&self.counter.to_le_bytes());
        bytes
    }

    /// Inverse of [`encode`](Self::encode)
    ///
    /// Fails on input that is too short or carries trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        if bytes.len() < 4 {
            return Err(SessionError::MalformedEnvelope("truncated length prefix"));
        }
        let ct_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;

        let expected = 4 + ct_len + NONCE_SIZE + EXCHANGE_KEY_SIZE + 8;
        if bytes.len() < expected {
            return Err(SessionError::MalformedEnvelope("truncated"));
        }
        if bytes.len() > expected {
            return Err(SessionError::MalformedEnvelope("trailing bytes"));
        }

        let ciphertext = bytes[4..4 + ct_len].to_vec();
        let mut cursor = 4 + ct_len;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[cursor..cursor + NONCE_SIZE]);
        cursor += NONCE_SIZE;

        let sender_ratchet_key =
            ExchangePublicKey::from_bytes(&bytes[cursor..cursor + EXCHANGE_KEY_SIZE])
                .map_err(|_| SessionError::MalformedEnvelope("bad ratchet key"))?;
        cursor += EXCHANGE_KEY_SIZE;

        let counter = u64::from_le_bytes(
            bytes[cursor..cursor + 8]
                .try_into()
                .expect("slice length checked above"),
        );

        Ok(MessageEnvelope {
            ciphertext,
            nonce,
            sender_ratchet_key,
            counter,
        })
    }
}
