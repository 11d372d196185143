//! Identifiers, timestamps and chat-id canonicalization.
//!
//! User, group and message ids are opaque strings with one constraint: they
//! never contain [`LABEL_SEPARATOR`]. That keeps key-derivation labels and chat
//! ids collision-free, since `direct:a:b` can only be parsed one way.

use std::fmt;

use courier_crypto::{LABEL_SEPARATOR, canonical_pair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted identifier, in bytes.
pub const MAX_ID_LEN: usize = 128;

/// Tag prefixed to direct chat ids.
const DIRECT_CHAT_TAG: &str = "direct";

/// Tag prefixed to group chat ids.
const GROUP_CHAT_TAG: &str = "group";

/// Identifier validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Identifier is empty
    #[error("{kind} id is empty")]
    Empty {
        /// Which identifier kind was rejected
        kind: &'static str,
    },

    /// Identifier exceeds [`MAX_ID_LEN`]
    #[error("{kind} id is {len} bytes, limit is 128")]
    TooLong {
        /// Which identifier kind was rejected
        kind: &'static str,
        /// Actual length in bytes
        len: usize,
    },

    /// Identifier contains the label separator
    #[error("{kind} id contains reserved separator ':'")]
    ReservedSeparator {
        /// Which identifier kind was rejected
        kind: &'static str,
    },

    /// Chat id does not have a known `direct:`/`group:` shape
    #[error("malformed chat id: {0}")]
    MalformedChatId(String),
}

fn validate(kind: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty { kind });
    }
    if value.len() > MAX_ID_LEN {
        return Err(IdError::TooLong { kind, len: value.len() });
    }
    if value.contains(LABEL_SEPARATOR) {
        return Err(IdError::ReservedSeparator { kind });
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap an identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                validate($kind, &value)?;
                Ok(Self(value))
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Opaque user identifier.
    UserId,
    "user"
);

string_id!(
    /// Opaque group identifier.
    GroupId,
    "group"
);

string_id!(
    /// Opaque message identifier.
    MessageId,
    "message"
);

impl MessageId {
    /// Message id from 128 random bits, rendered as 32 hex digits.
    pub fn from_random(bits: u128) -> Self {
        Self(format!("{bits:032x}"))
    }
}

/// Milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Timestamp from milliseconds since the Unix epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the Unix epoch.
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Kind of conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// One-to-one conversation
    Direct,
    /// Group conversation
    Group,
}

/// Canonical conversation id.
///
/// Direct chats: `direct:<lo>:<hi>` with the participants sorted exactly like
/// direct key labels. Groups: `group:<groupId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

/// Parsed form of a [`ChatId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatKind {
    /// Direct chat between two users, in canonical order
    Direct(UserId, UserId),
    /// Group chat
    Group(GroupId),
}

impl ChatId {
    /// Chat id for the direct conversation between `a` and `b`.
    ///
    /// Order-independent: `direct(a, b) == direct(b, a)`.
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = canonical_pair(a.as_str(), b.as_str());
        Self(format!("{DIRECT_CHAT_TAG}{LABEL_SEPARATOR}{lo}{LABEL_SEPARATOR}{hi}"))
    }

    /// Chat id for a group.
    pub fn group(group_id: &GroupId) -> Self {
        Self(format!("{GROUP_CHAT_TAG}{LABEL_SEPARATOR}{group_id}"))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into participants or group.
    ///
    /// # Errors
    ///
    /// - `MalformedChatId` if the id was not produced by [`chat_id_for`]
    pub fn kind(&self) -> Result<ChatKind, IdError> {
        let malformed = || IdError::MalformedChatId(self.0.clone());
        let mut parts = self.0.split(LABEL_SEPARATOR);

        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(DIRECT_CHAT_TAG), Some(lo), Some(hi), None) => {
                let lo = UserId::new(lo).map_err(|_| malformed())?;
                let hi = UserId::new(hi).map_err(|_| malformed())?;
                if lo > hi {
                    return Err(malformed());
                }
                Ok(ChatKind::Direct(lo, hi))
            },
            (Some(GROUP_CHAT_TAG), Some(group), None, None) => {
                Ok(ChatKind::Group(GroupId::new(group).map_err(|_| malformed())?))
            },
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chat id for `user_id`'s conversation with `target_id`.
///
/// `target_id` is the other participant for direct chats and the group id for
/// group chats. Two derivations starting from either participant agree.
///
/// # Errors
///
/// - `IdError` if `target_id` is not a valid identifier
pub fn chat_id_for(
    chat_type: ChatType,
    user_id: &UserId,
    target_id: &str,
) -> Result<ChatId, IdError> {
    match chat_type {
        ChatType::Direct => Ok(ChatId::direct(user_id, &UserId::new(target_id)?)),
        ChatType::Group => Ok(ChatId::group(&GroupId::new(target_id)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn rejects_empty_ids() {
        assert_eq!(UserId::new(""), Err(IdError::Empty { kind: "user" }));
    }

    #[test]
    fn rejects_separator_in_ids() {
        assert_eq!(GroupId::new("a:b"), Err(IdError::ReservedSeparator { kind: "group" }));
    }

    #[test]
    fn rejects_oversized_ids() {
        let long = "x".repeat(MAX_ID_LEN + 1);
        assert!(matches!(MessageId::new(long), Err(IdError::TooLong { len: 129, .. })));
    }

    #[test]
    fn random_message_ids_are_hex() {
        let id = MessageId::from_random(0xABCD);
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().ends_with("abcd"));
    }

    #[test]
    fn direct_chat_id_is_order_independent() {
        let a = user("alice");
        let b = user("bob");

        assert_eq!(ChatId::direct(&a, &b), ChatId::direct(&b, &a));
        assert_eq!(ChatId::direct(&a, &b).as_str(), "direct:alice:bob");
    }

    #[test]
    fn chat_id_for_agrees_from_both_sides() {
        let from_alice = chat_id_for(ChatType::Direct, &user("alice"), "bob").unwrap();
        let from_bob = chat_id_for(ChatType::Direct, &user("bob"), "alice").unwrap();

        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn group_chat_id_ignores_user() {
        let id = chat_id_for(ChatType::Group, &user("alice"), "team").unwrap();
        assert_eq!(id.as_str(), "group:team");
        assert_eq!(id, chat_id_for(ChatType::Group, &user("bob"), "team").unwrap());
    }

    #[test]
    fn chat_id_kind_roundtrip() {
        let direct = ChatId::direct(&user("zed"), &user("amy"));
        assert_eq!(direct.kind().unwrap(), ChatKind::Direct(user("amy"), user("zed")));

        let group = ChatId::group(&GroupId::new("team").unwrap());
        assert_eq!(group.kind().unwrap(), ChatKind::Group(GroupId::new("team").unwrap()));
    }

    #[test]
    fn malformed_chat_ids_rejected() {
        for raw in ["", "direct:a", "direct:b:a", "group:", "dm:a:b", "group:a:b"] {
            let id: ChatId = serde_json::from_str(&format!("\"{raw}\"")).unwrap();
            assert!(id.kind().is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn ids_deserialize_with_validation() {
        let ok: UserId = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(ok.as_str(), "alice");

        let bad: Result<UserId, _> = serde_json::from_str("\"a:b\"");
        assert!(bad.is_err());
    }
}
