//! Error types for the Courier delivery core.
//!
//! One taxonomy for all four components. Stale status updates and read-state
//! regressions are NOT errors; they come back as no-op outcomes
//! ([`crate::status::Advance::Stale`], [`crate::read_state::MarkSeen::Stale`]).
//!
//! Every error is scoped to the message or chat it names. Nothing here is
//! fatal to the process.

use courier_crypto::CryptoError;
use thiserror::Error;

use crate::ids::{ChatId, GroupId, IdError, MessageId, UserId};

/// Errors from key management, sealing, delivery and read-state operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Key derivation or rotation requested for a group this process does not
    /// know, or for a version it has never seen
    #[error("invalid group {group_id} (version {version:?})")]
    InvalidGroup {
        /// Group that was requested
        group_id: GroupId,
        /// Version that was requested, if any
        version: Option<u32>,
    },

    /// Envelope failed authentication: corrupted, tampered, or sealed under a
    /// different key or key version
    #[error("message could not be decrypted: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Payload is not a well-formed envelope
    #[error("malformed encrypted payload: {0}")]
    MalformedPayload(CryptoError),

    /// Message has both or neither of direct target and group target, or a
    /// `messageType` that disagrees with the target
    #[error("invalid addressing: {reason}")]
    InvalidAddressing {
        /// Which addressing rule was violated
        reason: &'static str,
    },

    /// Message record violates a metadata invariant (encryption metadata,
    /// reply linkage, UTF-8 payload)
    #[error("invalid message record: {reason}")]
    InvalidRecord {
        /// Which invariant was violated
        reason: &'static str,
    },

    /// No message with this id is tracked
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),

    /// A message with this id is already tracked
    #[error("duplicate message: {0}")]
    DuplicateMessage(MessageId),

    /// Status event from a user that is not a recipient of the message (or
    /// without an actor where one is required)
    #[error("{user_id:?} is not a recipient of message {message_id}")]
    NotARecipient {
        /// Message the event referred to
        message_id: MessageId,
        /// Acting user, if the event named one
        user_id: Option<UserId>,
    },

    /// Operation reserved for the message author
    #[error("{user_id} is not the author of message {message_id}")]
    NotAuthor {
        /// Message the operation referred to
        message_id: MessageId,
        /// User that attempted it
        user_id: UserId,
    },

    /// Operation not allowed on a deleted message
    #[error("message {0} is deleted")]
    MessageDeleted(MessageId),

    /// Message does not belong to the named chat
    #[error("message {message_id} is not part of chat {chat_id}")]
    ChatMismatch {
        /// Message that was referenced
        message_id: MessageId,
        /// Chat it was referenced from
        chat_id: ChatId,
    },

    /// Invalid identifier
    #[error("invalid id: {0}")]
    InvalidId(#[from] IdError),
}

impl CoreError {
    /// Returns true if the UI should show "this message could not be
    /// decrypted" for this error.
    pub fn is_undecryptable(&self) -> bool {
        matches!(self, Self::DecryptionFailed { .. } | Self::MalformedPayload(_))
    }

    /// Returns true if retrying after a state sync may succeed.
    ///
    /// An unknown group or message usually means a rotation broadcast or the
    /// message itself has not arrived yet. Everything else is a malformed
    /// request that fails the same way on every retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::InvalidGroup { .. } | Self::UnknownMessage(_))
    }
}

impl From<CryptoError> for CoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed { reason } => Self::DecryptionFailed { reason },
            other => Self::MalformedPayload(other),
        }
    }
}
