//! The two-level ratchet
//!
//! A DH ratchet advances on every direction change: the sender rotates
//! in a fresh keypair, the receiver adopts the rotated public key it
//! finds in the envelope, and both mix the resulting shared secret into
//! the root to derive the epoch's chain key. Within an epoch a
//! symmetric ratchet walks the chain one way, producing one message key
//! per message.
//!
//! The signed prekey pair doubles as the initial ratchet half: the
//! initiator's first rotation pairs its fresh ratchet key with the
//! peer's signed prekey, and the responder's first adoption pairs its
//! own signed prekey with the adopted key, so both arrive at the same
//! first epoch without any extra round trip.

use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypto::kdf::{self, SaltSequence, SHARED_SALT_SEED};
use crate::crypto::{Cipher, DhKeypair, ExchangePublicKey, SharedSecret};
use crate::handshake::{MasterSecret, Role};

use super::envelope::MessageEnvelope;
use super::SessionError;

const INFO_ROOT_SEED: &[u8] = b"backchannel root seed";
const INFO_CHAIN_SEED: &[u8] = b"backchannel chain seed";
const INFO_ROOT_STEP: &[u8] = b"backchannel root step";
const INFO_CHAIN_EPOCH: &[u8] = b"backchannel chain epoch";
const INFO_MESSAGE_KEY: &[u8] = b"backchannel message key";
const INFO_CHAIN_STEP: &[u8] = b"backchannel chain step";

/// Who established the chain epoch currently in effect
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RatchetDirection {
    /// The local side rotated its own key in; the chain is for sending
    Sending,
    /// A peer rotation was adopted; the chain is for receiving
    Receiving,
}

/// The two DH-ratchet triggers; exactly one fires per advance
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhAdvance {
    /// About to send with no active sending chain: rotate in a fresh
    /// own keypair
    RotateOwn,
    /// An envelope carried a ratchet key differing from the recorded
    /// peer key: adopt it
    AdoptPeer(ExchangePublicKey),
}

/// Per-conversation ratchet state
///
/// Mutated only through [`encrypt`](Self::encrypt),
/// [`decrypt`](Self::decrypt) and the advance operations. Concurrent
/// send and receive paths must serialize access through a mutex; the
/// state itself assumes exclusive access.
#[derive(ZeroizeOnDrop)]
pub struct Ratchet {
    root_key: [u8; 32],
    chain_key: [u8; 32],
    #[zeroize(skip)]
    own_ratchet: Option<DhKeypair>,
    #[zeroize(skip)]
    peer_ratchet: Option<ExchangePublicKey>,
    #[zeroize(skip)]
    chain_direction: Option<RatchetDirection>,
    #[zeroize(skip)]
    j: u64,
    #[zeroize(skip)]
    salts: SaltSequence,
}

impl Ratchet {
    /// Seed a fresh ratchet from a just-derived master secret
    ///
    /// The master secret is consumed. The initiator must supply the
    /// peer's signed prekey (its first rotation pairs against it); the
    /// responder's own signed prekey pair is enrolled as the initial
    /// own ratchet half instead.
    pub fn seed(
        master: MasterSecret,
        role: Role,
        own_signed_prekey: &DhKeypair,
        peer_signed_prekey: Option<&ExchangePublicKey>,
    ) -> Result<Self, SessionError> {
        let (own_ratchet, peer_ratchet) = match role {
            Role::Initiator => {
                let peer = *peer_signed_prekey.ok_or(SessionError::NoPeerRatchetKey)?;
                (None, Some(peer))
            }
            Role::Responder => (Some(own_signed_prekey.clone()), None),
        };

        Ok(Ratchet {
            root_key: kdf::derive(&[], master.as_bytes(), INFO_ROOT_SEED),
            chain_key: kdf::derive(&[], master.as_bytes(), INFO_CHAIN_SEED),
            own_ratchet,
            peer_ratchet,
            chain_direction: None,
            j: 0,
            salts: SaltSequence::new(SHARED_SALT_SEED),
        })
    }

    /// Advance the DH ratchet
    ///
    /// Resets the chain counter to zero and replaces the chain key with
    /// one mixed from the root and the fresh DH output.
    pub fn advance_dh_ratchet(&mut self, step: DhAdvance) -> Result<(), SessionError> {
        match step {
            DhAdvance::RotateOwn => {
                let peer = self.peer_ratchet.ok_or(SessionError::NoPeerRatchetKey)?;
                let fresh = DhKeypair::generate();
                let dh = fresh.diffie_hellman(&peer);
                self.mix_chain(&dh);
                self.own_ratchet = Some(fresh);
                self.chain_direction = Some(RatchetDirection::Sending);
            }
            DhAdvance::AdoptPeer(peer_key) => {
                let own = self
                    .own_ratchet
                    .as_ref()
                    .ok_or(SessionError::NoOwnRatchetKey)?;
                let dh = own.diffie_hellman(&peer_key);
                self.mix_chain(&dh);
                self.peer_ratchet = Some(peer_key);
                self.chain_direction = Some(RatchetDirection::Receiving);
            }
        }

        self.j = 0;
        Ok(())
    }

    /// Advance the symmetric ratchet one step
    ///
    /// Derives the next message key, walks the chain key forward
    /// through a one-way derivation and increments the chain counter.
    pub fn advance_symmetric_ratchet(&mut self) -> Zeroizing<[u8; 32]> {
        let salt = self.salts.advance();
        let message_key = Zeroizing::new(kdf::derive(&salt, &self.chain_key, INFO_MESSAGE_KEY));
        self.chain_key = kdf::derive(&salt, &self.chain_key, INFO_CHAIN_STEP);
        self.j += 1;
        message_key
    }

    /// Encrypt one application message
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<MessageEnvelope, SessionError> {
        if self.chain_direction != Some(RatchetDirection::Sending) {
            self.advance_dh_ratchet(DhAdvance::RotateOwn)?;
        }

        let message_key = self.advance_symmetric_ratchet();
        let sender_ratchet_key = *self
            .own_ratchet
            .as_ref()
            .ok_or(SessionError::NoOwnRatchetKey)?
            .public_key();
        let counter = self.j;

        let aad = envelope_aad(&sender_ratchet_key, counter);
        let (ciphertext, nonce) = Cipher::seal(&message_key, plaintext, &aad);

        Ok(MessageEnvelope {
            ciphertext,
            nonce,
            sender_ratchet_key,
            counter,
        })
    }

    /// Decrypt one application message
    ///
    /// An authentication failure is fatal to this message only; the
    /// state keeps the step it took and the next in-order message still
    /// decrypts.
    pub fn decrypt(&mut self, envelope: &MessageEnvelope) -> Result<Vec<u8>, SessionError> {
        if self.peer_ratchet != Some(envelope.sender_ratchet_key) {
            self.advance_dh_ratchet(DhAdvance::AdoptPeer(envelope.sender_ratchet_key))?;
        }

        let message_key = self.advance_symmetric_ratchet();
        if envelope.counter != self.j {
            tracing::debug!(
                envelope = envelope.counter,
                local = self.j,
                "chain counter drift; a message was likely dropped"
            );
        }

        let aad = envelope_aad(&envelope.sender_ratchet_key, envelope.counter);
        Cipher::open(&message_key, &envelope.nonce, &envelope.ciphertext, &aad)
            .map_err(|_| SessionError::DecryptionFailed)
    }

    /// Symmetric steps taken since the last DH-ratchet advance
    pub fn counter(&self) -> u64 {
        self.j
    }

    /// The peer ratchet key currently recorded
    pub fn peer_ratchet_key(&self) -> Option<&ExchangePublicKey> {
        self.peer_ratchet.as_ref()
    }

    /// Our current ratchet public key, once one exists
    pub fn own_ratchet_key(&self) -> Option<ExchangePublicKey> {
        self.own_ratchet.as_ref().map(|kp| *kp.public_key())
    }

    fn mix_chain(&mut self, dh: &SharedSecret) {
        let salt = self.salts.advance();
        let mut ikm = Zeroizing::new([0u8; 64]);
        ikm[..32].copy_from_slice(&self.root_key);
        ikm[32..].copy_from_slice(dh.as_bytes());

        self.root_key = kdf::derive(&salt, ikm.as_slice(), INFO_ROOT_STEP);
        self.chain_key = kdf::derive(&salt, &self.root_key, INFO_CHAIN_EPOCH);
    }
}

fn envelope_aad(sender_ratchet_key: &ExchangePublicKey, counter: u64) -> [u8; 40] {
    let mut aad = [0u8; 40];
    aad[..32].copy_from_slice(sender_ratchet_key.as_bytes());
    aad[32..].copy_from_slice(&counter.to_le_bytes());
    aad
}
