//! Courier Cryptographic Primitives
//!
//! Building blocks for the Courier delivery core. Pure functions with
//! deterministic outputs. Callers provide nonces so that tests can pin them;
//! production callers draw every nonce from a cryptographic RNG.
//!
//! # Key Lifecycle
//!
//! There is no key exchange. Both ends of a conversation compute the same
//! label from public identifiers and derive the same key from it.
//!
//! ```text
//! (user A, user B)                  (group G, version v)
//!        │ sort                              │
//!        ▼                                   ▼
//! "direct:<lo>:<hi>"                 "group:<G>:v<v>"
//!        │                                   │
//!        └──────────────┬────────────────────┘
//!                       ▼
//!         HKDF-SHA256(salt = KEY_NAMESPACE)
//!                       │
//!                       ▼
//!               256-bit SymmetricKey
//!                       │
//!                       ▼
//!     ChaCha20-Poly1305(random 96-bit nonce)
//!                       │
//!                       ▼
//!        Envelope = nonce || ciphertext || tag
//! ```
//!
//! Group keys are versioned. Rotating a group moves new traffic to the next
//! version while every earlier version stays derivable, so backlog messages
//! tagged with an old version still decrypt.
//!
//! # Security
//!
//! Confidentiality:
//! - Holds against passive observers who do not know the derivation scheme
//! - Does NOT hold against anyone who knows the scheme and both identifiers;
//!   there is no secret input and no forward secrecy
//!
//! Integrity:
//! - Poly1305 tag rejects tampered or wrong-key envelopes
//! - Failed authentication is always an error, never a pass-through
//! - The sender identity is not bound into the envelope (no associated data)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod derivation;
pub mod envelope;
pub mod error;
pub mod key;

pub use derivation::{
    KEY_NAMESPACE, LABEL_SEPARATOR, canonical_pair, derive_direct_key, derive_group_key,
    direct_label, group_label,
};
pub use envelope::{Envelope, NONCE_SIZE, TAG_SIZE, decrypt, encrypt};
pub use error::CryptoError;
pub use key::{KEY_SIZE, SymmetricKey};
