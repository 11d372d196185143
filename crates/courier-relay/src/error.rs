//! Relay error types.
//!
//! Wraps the delivery core's errors and adds the directory's membership and
//! authorization failures. Every variant is scoped to the event that caused
//! it; the driver turns them into `Rejected` notices rather than stopping.

use courier_core::{CoreError, GroupId, UserId};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur while the relay processes an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Delivery, sealing or read-state rule violated.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage backend failed during recovery or execution.
    ///
    /// Transient for injected or I/O failures; see [`StorageError`].
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Group was never created.
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    /// Group id already taken.
    #[error("group already exists: {0}")]
    GroupExists(GroupId),

    /// Actor is not a member of the group.
    #[error("user {user_id} is not a member of group {group_id}")]
    NotAMember {
        /// Group
        group_id: GroupId,
        /// Actor
        user_id: UserId,
    },

    /// Actor's role does not allow the operation.
    #[error("user {user_id} is not authorized in group {group_id}")]
    NotAuthorized {
        /// Group
        group_id: GroupId,
        /// Actor
        user_id: UserId,
    },

    /// Group is at its member limit.
    #[error("group {group_id} is full ({limit} members)")]
    GroupFull {
        /// Group
        group_id: GroupId,
        /// Configured limit
        limit: usize,
    },

    /// Group key version cannot be incremented further.
    #[error("key version exhausted for group {0}")]
    VersionExhausted(GroupId),

    /// Submitted message claims a key version the group never announced.
    #[error("group {group_id} has no key version {version}")]
    UnannouncedVersion {
        /// Group
        group_id: GroupId,
        /// Version on the message
        version: u32,
    },
}

impl RelayError {
    /// Returns true if the same event may succeed after a retry or a state
    /// sync.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Core(err) => err.is_transient(),
            Self::Storage(err) => err.is_transient(),
            Self::UnknownGroup(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::MessageId;

    use super::*;

    #[test]
    fn transient_classification() {
        let group = GroupId::new("team").unwrap();
        let user = UserId::new("bob").unwrap();

        assert!(RelayError::UnknownGroup(group.clone()).is_transient());
        assert!(RelayError::Storage(StorageError::Io("disk".into())).is_transient());
        assert!(!RelayError::Storage(StorageError::Poisoned).is_transient());
        assert!(
            RelayError::Core(CoreError::UnknownMessage(MessageId::new("m").unwrap())).is_transient()
        );
        assert!(!RelayError::NotAuthorized { group_id: group, user_id: user }.is_transient());
    }

    #[test]
    fn core_errors_display_transparently() {
        let core = CoreError::UnknownMessage(MessageId::new("m1").unwrap());
        assert_eq!(RelayError::from(core.clone()).to_string(), core.to_string());
    }
}
