//! Symmetric key material.

use std::fmt;

use zeroize::Zeroize;

/// Size of a symmetric key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// A 256-bit symmetric key for ChaCha20-Poly1305.
///
/// Key bytes are zeroized on drop and never appear in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}
