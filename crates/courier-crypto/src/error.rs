//! Error types for envelope operations

use thiserror::Error;

/// Errors from envelope decoding and decryption
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Authentication tag mismatch: corrupted, tampered, or sealed under a
    /// different key or key version
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Envelope too short to hold a nonce and a tag
    #[error("malformed envelope: {len} bytes, need at least {min}")]
    MalformedEnvelope {
        /// Actual envelope length
        len: usize,
        /// Minimum valid length
        min: usize,
    },

    /// Transport encoding (base64) could not be decoded
    #[error("invalid envelope encoding: {0}")]
    InvalidEncoding(String),
}

impl CryptoError {
    /// Returns true if the envelope was well-formed but failed authentication.
    ///
    /// Callers surface these as "this message could not be decrypted" rather
    /// than as a transport problem.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::DecryptionFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_failed_is_authentication_failure() {
        let err = CryptoError::DecryptionFailed { reason: "tag mismatch".to_string() };
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn framing_errors_are_not_authentication_failures() {
        assert!(!CryptoError::MalformedEnvelope { len: 3, min: 28 }.is_authentication_failure());
        assert!(!CryptoError::InvalidEncoding("bad".to_string()).is_authentication_failure());
    }

    #[test]
    fn error_display() {
        let err = CryptoError::MalformedEnvelope { len: 3, min: 28 };
        assert_eq!(err.to_string(), "malformed envelope: 3 bytes, need at least 28");
    }
}
