//! Envelope encryption using `ChaCha20-Poly1305`
//!
//! An envelope is self-describing: the 96-bit nonce travels in front of the
//! ciphertext, so decryption needs nothing but the key. Both functions are
//! pure; the nonce is provided by the caller.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};

use crate::{error::CryptoError, key::SymmetricKey};

/// Size of the nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Sealed payload: nonce plus ciphertext (tag included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The 12-byte nonce used for this envelope
    nonce: [u8; NONCE_SIZE],
    /// The ciphertext including the 16-byte Poly1305 tag
    ciphertext: Vec<u8>,
}

impl Envelope {
    /// Nonce this envelope was sealed with.
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Ciphertext including the authentication tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_SIZE)
    }

    /// Wire bytes: `nonce || ciphertext || tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Split wire bytes into nonce and ciphertext.
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope` if shorter than a nonce plus a tag
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let min = NONCE_SIZE + TAG_SIZE;
        if bytes.len() < min {
            return Err(CryptoError::MalformedEnvelope { len: bytes.len(), min });
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);

        Ok(Self { nonce, ciphertext: ciphertext.to_vec() })
    }

    /// Transport form stored in a message's `text`/`image` field (base64).
    pub fn encode(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Parse the transport form.
    ///
    /// # Errors
    ///
    /// - `InvalidEncoding` if the input is not base64
    /// - `MalformedEnvelope` if the decoded bytes are too short
    pub fn decode(encoded: &str) -> Result<Self, CryptoError> {
        let bytes =
            STANDARD.decode(encoded).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// Encrypt `plaintext` under `key` with the given nonce.
///
/// # Security
///
/// A nonce MUST NOT be reused with the same key. Production callers pass
/// fresh bytes from a cryptographically secure RNG for every call.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey, nonce: [u8; NONCE_SIZE]) -> Envelope {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&nonce), plaintext) else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    Envelope { nonce, ciphertext }
}

/// Decrypt an envelope under `key`.
///
/// # Errors
///
/// - `DecryptionFailed`: authentication tag mismatch (tamper, corruption, or
///   wrong key/version)
pub fn decrypt(envelope: &Envelope, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })
}
