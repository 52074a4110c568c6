//! # Backchannel
//!
//! End-to-end confidential messaging between two devices over an
//! untrusted topic broker. A semi-trusted coordinator stores public key
//! bundles and brokers the initial handoff, but never sees session keys
//! or plaintext.
//!
//! ## Protocol sketch
//!
//! ```text
//! ┌──────────┐   register / request    ┌─────────────┐
//! │  node A  │────────────────────────▶│ coordinator │
//! └────┬─────┘◀──── bundle handoff ────└─────────────┘
//!      │                                      ▲
//!      │  X3DH handshake -> master secret     │ register
//!      │  double ratchet -> per-message keys  │
//!      ▼                                      │
//! ┌──────────┐     A_to_B / B_to_A      ┌─────┴────┐
//! │  broker  │◀────────────────────────▶│  node B  │
//! └──────────┘   encrypted envelopes    └──────────┘
//! ```
//!
//! Each side runs the handshake with the opposite role and derives the
//! same master secret; the ratchet then rotates a DH keypair on every
//! direction change and walks a symmetric chain within a direction, so
//! every message is encrypted under a key used exactly once.
//!
//! ## Quick start
//!
//! ```rust
//! use backchannel::{Identity, PublicBundle, Redaction};
//!
//! // A node's identity, and the bundle it registers
//! let identity = Identity::new("+15550100");
//! let bundle = identity.public_bundle();
//!
//! // Redacted fields are absent from the bytes, not null-filled
//! let bytes = bundle.serialize(&Redaction::none().without_ephemeral());
//! let view = PublicBundle::deserialize(&bytes).unwrap();
//! assert!(view.ephemeral.is_none());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bundle;
pub mod coordinator;
pub mod crypto;
pub mod handshake;
pub mod node;
pub mod session;
pub mod transport;

// Re-export main types at crate root
pub use bundle::{Identity, PublicBundle, Redaction};
pub use coordinator::Coordinator;
pub use crypto::{random_bytes, CryptoError};
pub use handshake::{MasterSecret, Role};
pub use node::{Node, NodeEvent};
pub use session::{MessageEnvelope, Ratchet, Session};
