//! Node identities and their public key bundles
//!
//! An [`Identity`] is the full private key material of one node: the
//! long-term identity key, the medium-term signed prekey, and the
//! single-use handshake ephemeral. A [`PublicBundle`] is its public
//! projection, serialized with an explicit [`Redaction`] mask so that a
//! field left out of a serialization is absent from the bytes, not
//! null-filled.

use thiserror::Error;

use crate::crypto::{
    exchange::EXCHANGE_KEY_SIZE,
    signing::{SIGNATURE_SIZE, VERIFY_KEY_SIZE},
    DhKeypair, ExchangePublicKey, SignatureBytes, SigningKeypair, VerifyKey,
};

const BUNDLE_VERSION: u8 = 0x01;

const TAG_ID: u8 = 0x01;
const TAG_IDENTITY: u8 = 0x02;
const TAG_PREKEY: u8 = 0x03;
const TAG_EPHEMERAL: u8 = 0x04;

/// Errors from bundle serialization and deserialization
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    /// The bytes are not a valid bundle serialization
    #[error("malformed bundle: {0}")]
    MalformedBundle(&'static str),
}

/// Derive a node id from a phone number
///
/// The id is public and deterministic, so a contact list mapping names
/// to phone numbers can resolve ids without asking anyone.
pub fn derive_node_id(phone_number: &str) -> String {
    let digest = blake3::derive_key("backchannel node id v1", phone_number.as_bytes());
    hex::encode(&digest[..8])
}

/// The full private key material of one node
///
/// Exactly one per node. The ephemeral keypair is single-use: it is
/// regenerated after every handshake it participates in.
pub struct Identity {
    id: String,
    phone_number: String,
    signing: SigningKeypair,
    identity_key: DhKeypair,
    signed_prekey: DhKeypair,
    prekey_signature: SignatureBytes,
    ephemeral: Option<DhKeypair>,
}

impl Identity {
    /// Generate a fresh identity for a phone number
    pub fn new(phone_number: &str) -> Self {
        let signing = SigningKeypair::generate();
        let signed_prekey = DhKeypair::generate();
        let prekey_signature = signing.sign(signed_prekey.public_key().as_bytes());

        Identity {
            id: derive_node_id(phone_number),
            phone_number: phone_number.to_string(),
            signing,
            identity_key: DhKeypair::generate(),
            signed_prekey,
            prekey_signature,
            ephemeral: Some(DhKeypair::generate()),
        }
    }

    /// The node id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The phone number this identity was derived from
    pub fn phone_number(&self) -> &str {
        &self.phone_number
    }

    /// The long-term identity keypair
    pub fn identity_keypair(&self) -> &DhKeypair {
        &self.identity_key
    }

    /// The medium-term signed prekey pair
    pub fn signed_prekey_pair(&self) -> &DhKeypair {
        &self.signed_prekey
    }

    /// The current handshake ephemeral, if one is outstanding
    pub fn ephemeral_keypair(&self) -> Option<&DhKeypair> {
        self.ephemeral.as_ref()
    }

    /// Replace the ephemeral keypair with a fresh one
    ///
    /// Returns the new public key, ready to be republished.
    pub fn generate_ephemeral(&mut self) -> ExchangePublicKey {
        let fresh = DhKeypair::generate();
        let public = *fresh.public_key();
        self.ephemeral = Some(fresh);
        public
    }

    /// The public projection of this identity
    pub fn public_bundle(&self) -> PublicBundle {
        PublicBundle {
            id: self.id.clone(),
            identity: Some(IdentityPublic {
                exchange: *self.identity_key.public_key(),
                verify: *self.signing.verify_key(),
            }),
            signed_prekey: Some(SignedPrekeyPublic {
                key: *self.signed_prekey.public_key(),
                signature: self.prekey_signature,
            }),
            ephemeral: self.ephemeral.as_ref().map(|e| *e.public_key()),
        }
    }
}

/// Public half of a long-term identity: the DH key and the verify key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityPublic {
    /// X25519 key used in the handshake DH set
    pub exchange: ExchangePublicKey,
    /// Ed25519 key that vouches for the signed prekey
    pub verify: VerifyKey,
}

/// Public half of the signed prekey, with its signature
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedPrekeyPublic {
    /// X25519 prekey
    pub key: ExchangePublicKey,
    /// Signature over the prekey bytes by the identity's signing key
    pub signature: SignatureBytes,
}

/// Which optional fields to leave out of a serialization
///
/// Resolved explicitly at every call site. A redacted field is absent
/// from the produced bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Redaction {
    /// Omit the identity keys
    pub identity: bool,
    /// Omit the signed prekey and its signature
    pub signed_prekey: bool,
    /// Omit the ephemeral key
    pub ephemeral: bool,
}

impl Redaction {
    /// Redact nothing
    pub fn none() -> Self {
        Redaction::default()
    }

    /// Additionally omit the identity keys
    pub fn without_identity(mut self) -> Self {
        self.identity = true;
        self
    }

    /// Additionally omit the signed prekey
    pub fn without_signed_prekey(mut self) -> Self {
        self.signed_prekey = true;
        self
    }

    /// Additionally omit the ephemeral key
    pub fn without_ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }
}

/// The public-key projection of an identity
///
/// Every field except the id is optional: a bundle may have been
/// serialized under a redaction mask, or had its ephemeral cleared by
/// the coordinator's single-use policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicBundle {
    /// Node id this bundle belongs to
    pub id: String,
    /// Long-term identity keys
    pub identity: Option<IdentityPublic>,
    /// Signed prekey and signature
    pub signed_prekey: Option<SignedPrekeyPublic>,
    /// Single-use handshake ephemeral
    pub ephemeral: Option<ExchangePublicKey>,
}

impl PublicBundle {
    /// Serialize every field that is present and not redacted
    pub fn serialize(&self, redact: &Redaction) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(160);
        bytes.push(BUNDLE_VERSION);

        bytes.push(TAG_ID);
        let id_bytes = self.id.as_bytes();
        bytes.extend_from_slice(&(id_bytes.len() as u16).to_le_bytes());
        bytes.extend_from_slice(id_bytes);

        if let (Some(identity), false) = (&self.identity, redact.identity) {
            bytes.push(TAG_IDENTITY);
            bytes.extend_from_slice(identity.exchange.as_bytes());
            bytes.extend_from_slice(identity.verify.as_bytes());
        }

        if let (Some(prekey), false) = (&self.signed_prekey, redact.signed_prekey) {
            bytes.push(TAG_PREKEY);
            bytes.extend_from_slice(prekey.key.as_bytes());
            bytes.extend_from_slice(prekey.signature.as_bytes());
        }

        if let (Some(ephemeral), false) = (&self.ephemeral, redact.ephemeral) {
            bytes.push(TAG_EPHEMERAL);
            bytes.extend_from_slice(ephemeral.as_bytes());
        }

        bytes
    }

    /// Inverse of [`serialize`](Self::serialize)
    pub fn deserialize(bytes: &[u8]) -> Result<Self, BundleError> {
        let mut r = Reader::new(bytes);

        if r.u8()? != BUNDLE_VERSION {
            return Err(BundleError::MalformedBundle("unsupported version"));
        }

        let mut id = None;
        let mut identity = None;
        let mut signed_prekey = None;
        let mut ephemeral = None;

        while !r.done() {
            match r.u8()? {
                TAG_ID => {
                    if id.is_some() {
                        return Err(BundleError::MalformedBundle("duplicate id field"));
                    }
                    let len = r.u16()? as usize;
                    let raw = r.take(len)?;
                    let s = std::str::from_utf8(raw)
                        .map_err(|_| BundleError::MalformedBundle("id is not valid utf-8"))?;
                    id = Some(s.to_string());
                }
                TAG_IDENTITY => {
                    if identity.is_some() {
                        return Err(BundleError::MalformedBundle("duplicate identity field"));
                    }
                    let exchange = read_exchange_key(&mut r)?;
                    let verify = VerifyKey::from_bytes(r.take(VERIFY_KEY_SIZE)?)
                        .map_err(|_| BundleError::MalformedBundle("bad verify key"))?;
                    identity = Some(IdentityPublic { exchange, verify });
                }
                TAG_PREKEY => {
                    if signed_prekey.is_some() {
                        return Err(BundleError::MalformedBundle("duplicate prekey field"));
                    }
                    let key = read_exchange_key(&mut r)?;
                    let signature = SignatureBytes::from_bytes(r.take(SIGNATURE_SIZE)?)
                        .map_err(|_| BundleError::MalformedBundle("bad prekey signature"))?;
                    signed_prekey = Some(SignedPrekeyPublic { key, signature });
                }
                TAG_EPHEMERAL => {
                    if ephemeral.is_some() {
                        return Err(BundleError::MalformedBundle("duplicate ephemeral field"));
                    }
                    ephemeral = Some(read_exchange_key(&mut r)?);
                }
                _ => return Err(BundleError::MalformedBundle("unknown field tag")),
            }
        }

        Ok(PublicBundle {
            id: id.ok_or(BundleError::MalformedBundle("missing id field"))?,
            identity,
            signed_prekey,
            ephemeral,
        })
    }

    /// Overwrite the fields present in `other`, leaving the rest untouched
    ///
    /// Used for the ephemeral-key republish, where the partial bundle
    /// carries only the fresh ephemeral.
    pub fn merge(&mut self, other: PublicBundle) {
        if let Some(identity) = other.identity {
            self.identity = Some(identity);
        }
        if let Some(prekey) = other.signed_prekey {
            self.signed_prekey = Some(prekey);
        }
        if let Some(ephemeral) = other.ephemeral {
            self.ephemeral = Some(ephemeral);
        }
    }
}

fn read_exchange_key(r: &mut Reader<'_>) -> Result<ExchangePublicKey, BundleError> {
    ExchangePublicKey::from_bytes(r.take(EXCHANGE_KEY_SIZE)?)
        .map_err(|_| BundleError::MalformedBundle("bad exchange key"))
}

/// Cursor over a byte slice that fails with `MalformedBundle` on underrun
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn done(&self) -> bool {
        self.buf.is_empty()
    }

    fn u8(&mut self) -> Result<u8, BundleError> {
        let (&b, rest) = self
            .buf
            .split_first()
            .ok_or(BundleError::MalformedBundle("truncated"))?;
        self.buf = rest;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, BundleError> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BundleError> {
        if self.buf.len() < n {
            return Err(BundleError::MalformedBundle("truncated"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_has_all_keys() {
        let identity = Identity::new("+15550100");
        let bundle = identity.public_bundle();

        assert_eq!(bundle.id, derive_node_id("+15550100"));
        assert!(bundle.identity.is_some());
        assert!(bundle.signed_prekey.is_some());
        assert!(bundle.ephemeral.is_some());
    }

    #[test]
    fn test_prekey_signature_verifies() {
        let identity = Identity::new("+15550100");
        let bundle = identity.public_bundle();

        let identity_pub = bundle.identity.unwrap();
        let prekey = bundle.signed_prekey.unwrap();
        assert!(identity_pub
            .verify
            .verify(prekey.key.as_bytes(), &prekey.signature)
            .is_ok());
    }

    #[test]
    fn test_generate_ephemeral_replaces() {
        let mut identity = Identity::new("+15550100");
        let old = *identity.ephemeral_keypair().unwrap().public_key();

        let fresh = identity.generate_ephemeral();

        assert_ne!(old, fresh);
        assert_eq!(*identity.ephemeral_keypair().unwrap().public_key(), fresh);
    }

    #[test]
    fn test_node_id_deterministic() {
        assert_eq!(derive_node_id("+15550100"), derive_node_id("+15550100"));
        assert_ne!(derive_node_id("+15550100"), derive_node_id("+15550101"));
    }

    #[test]
    fn test_serialize_roundtrip_full() {
        let bundle = Identity::new("+15550100").public_bundle();

        let bytes = bundle.serialize(&Redaction::none());
        let restored = PublicBundle::deserialize(&bytes).unwrap();

        assert_eq!(bundle, restored);
    }

    #[test]
    fn test_redacted_fields_are_absent() {
        let bundle = Identity::new("+15550100").public_bundle();

        let bytes = bundle.serialize(&Redaction::none().without_ephemeral());
        let restored = PublicBundle::deserialize(&bytes).unwrap();

        assert!(restored.ephemeral.is_none());
        assert_eq!(restored.identity, bundle.identity);
        assert_eq!(restored.signed_prekey, bundle.signed_prekey);

        let bytes = bundle.serialize(&Redaction::none().without_signed_prekey());
        let restored = PublicBundle::deserialize(&bytes).unwrap();

        assert!(restored.signed_prekey.is_none());
        assert_eq!(restored.ephemeral, bundle.ephemeral);
    }

    #[test]
    fn test_ephemeral_only_partial() {
        let bundle = Identity::new("+15550100").public_bundle();

        let bytes = bundle.serialize(
            &Redaction::none()
                .without_identity()
                .without_signed_prekey(),
        );
        let restored = PublicBundle::deserialize(&bytes).unwrap();

        assert_eq!(restored.id, bundle.id);
        assert!(restored.identity.is_none());
        assert!(restored.signed_prekey.is_none());
        assert_eq!(restored.ephemeral, bundle.ephemeral);
    }

    #[test]
    fn test_deserialize_truncated_fails() {
        let bundle = Identity::new("+15550100").public_bundle();
        let bytes = bundle.serialize(&Redaction::none());

        for cut in [0, 1, 5, bytes.len() - 1] {
            assert!(matches!(
                PublicBundle::deserialize(&bytes[..cut]),
                Err(BundleError::MalformedBundle(_))
            ));
        }
    }

    #[test]
    fn test_deserialize_rejects_bad_version_and_tag() {
        let bundle = Identity::new("+15550100").public_bundle();
        let mut bytes = bundle.serialize(&Redaction::none());

        bytes[0] = 0x7F;
        assert!(PublicBundle::deserialize(&bytes).is_err());

        bytes[0] = BUNDLE_VERSION;
        bytes[1] = 0x7F; // first field tag
        assert!(PublicBundle::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let bundle = Identity::new("+15550100").public_bundle();
        let mut bytes = bundle.serialize(&Redaction::none());
        bytes.push(0xAA);

        assert!(PublicBundle::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_merge_overwrites_only_present_fields() {
        let mut stored = Identity::new("+15550100").public_bundle();
        let original_identity = stored.identity;
        let original_prekey = stored.signed_prekey;

        let mut fresh_source = Identity::new("+15550100");
        let fresh_eph = fresh_source.generate_ephemeral();
        let partial = PublicBundle {
            id: stored.id.clone(),
            identity: None,
            signed_prekey: None,
            ephemeral: Some(fresh_eph),
        };

        stored.merge(partial);

        assert_eq!(stored.identity, original_identity);
        assert_eq!(stored.signed_prekey, original_prekey);
        assert_eq!(stored.ephemeral, Some(fresh_eph));
    }
}
