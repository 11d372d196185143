//! Read-State Tracker: per-(user, chat) watermarks and unread counts.
//!
//! The watermark (`lastSeenTimestamp`) only moves forward. A `markSeen` at or
//! before the stored watermark is absorbed as [`MarkSeen::Stale`], so
//! out-of-order syncs from several devices converge on the latest one.
//!
//! Unread counts are always recomputed from the message stream with
//! [`compute_unread`]; the stored `unreadCount` is a cache for clients.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    error::CoreError,
    ids::{ChatId, ChatKind, ChatType, MessageId, Timestamp, UserId, chat_id_for},
    message::Message,
};

/// One user's cursor in one chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReadState {
    /// Reader
    pub user_id: UserId,
    /// Chat
    pub chat_id: ChatId,
    /// Kind of chat
    pub chat_type: ChatType,
    /// Other participant (direct) or group id
    pub target_id: String,
    /// Latest message the reader confirmed seeing
    #[serde(default)]
    pub last_seen_message_id: Option<MessageId>,
    /// Watermark
    #[serde(default)]
    pub last_seen_timestamp: Option<Timestamp>,
    /// Cached unread count, never authoritative
    #[serde(default)]
    pub unread_count: u32,
    /// Last time the reader had the chat open
    pub last_active_at: Timestamp,
}

impl ChatReadState {
    fn new(user_id: UserId, chat_id: ChatId, chat_type: ChatType, target_id: String, at: Timestamp) -> Self {
        Self {
            user_id,
            chat_id,
            chat_type,
            target_id,
            last_seen_message_id: None,
            last_seen_timestamp: None,
            unread_count: 0,
            last_active_at: at,
        }
    }
}

/// Result of [`ReadStateTracker::mark_seen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkSeen {
    /// Watermark moved forward
    Advanced {
        /// Watermark before the update, `None` on first view
        previous: Option<Timestamp>,
    },
    /// Not later than the stored watermark; nothing changed
    Stale,
}

impl MarkSeen {
    /// Whether the watermark moved.
    pub fn is_advanced(self) -> bool {
        matches!(self, Self::Advanced { .. })
    }
}

/// Read state for every (user, chat) pair the process knows.
#[derive(Debug, Clone, Default)]
pub struct ReadStateTracker {
    states: HashMap<(UserId, ChatId), ChatReadState>,
}

impl ReadStateTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user_id` opened a chat, creating its row on first view.
    ///
    /// `last_active_at` never moves backwards.
    ///
    /// # Errors
    ///
    /// - `InvalidId` if `target_id` is not a valid identifier
    pub fn open_chat(
        &mut self,
        user_id: &UserId,
        chat_type: ChatType,
        target_id: &str,
        at: Timestamp,
    ) -> Result<&ChatReadState, CoreError> {
        let chat_id = chat_id_for(chat_type, user_id, target_id)?;
        let state = self
            .states
            .entry((user_id.clone(), chat_id.clone()))
            .or_insert_with(|| {
                ChatReadState::new(user_id.clone(), chat_id, chat_type, target_id.to_string(), at)
            });
        state.last_active_at = state.last_active_at.max(at);
        Ok(state)
    }

    /// Move `user_id`'s watermark in `chat_id` to `at`, upserting the row.
    ///
    /// A timestamp not later than the stored watermark is a no-op.
    ///
    /// # Errors
    ///
    /// - `InvalidId` if `chat_id` is malformed
    /// - `NotARecipient` if `user_id` is not a participant of a direct chat
    pub fn mark_seen(
        &mut self,
        user_id: &UserId,
        chat_id: &ChatId,
        message_id: &MessageId,
        at: Timestamp,
    ) -> Result<MarkSeen, CoreError> {
        let (chat_type, target_id) = match chat_id.kind()? {
            ChatKind::Direct(lo, hi) => {
                let other = if &lo == user_id {
                    hi
                } else if &hi == user_id {
                    lo
                } else {
                    return Err(CoreError::NotARecipient {
                        message_id: message_id.clone(),
                        user_id: Some(user_id.clone()),
                    });
                };
                (ChatType::Direct, String::from(other))
            },
            ChatKind::Group(group_id) => (ChatType::Group, String::from(group_id)),
        };

        let state = self.states.entry((user_id.clone(), chat_id.clone())).or_insert_with(|| {
            ChatReadState::new(user_id.clone(), chat_id.clone(), chat_type, target_id, at)
        });

        let previous = state.last_seen_timestamp;
        if previous.is_some_and(|watermark| at <= watermark) {
            trace!(user_id = %user_id, chat_id = %chat_id, at = %at, "stale mark-seen ignored");
            return Ok(MarkSeen::Stale);
        }

        state.last_seen_message_id = Some(message_id.clone());
        state.last_seen_timestamp = Some(at);
        state.last_active_at = state.last_active_at.max(at);
        Ok(MarkSeen::Advanced { previous })
    }

    /// Stored row, if any.
    pub fn get(&self, user_id: &UserId, chat_id: &ChatId) -> Option<&ChatReadState> {
        self.states.get(&(user_id.clone(), chat_id.clone()))
    }

    /// `user_id`'s watermark in `chat_id`.
    pub fn watermark(&self, user_id: &UserId, chat_id: &ChatId) -> Option<Timestamp> {
        self.get(user_id, chat_id).and_then(|state| state.last_seen_timestamp)
    }

    /// Store a recomputed unread count.
    ///
    /// Returns `None` if there is no row, otherwise whether the cached count
    /// changed.
    pub fn sync_unread(&mut self, user_id: &UserId, chat_id: &ChatId, count: u32) -> Option<bool> {
        let state = self.states.get_mut(&(user_id.clone(), chat_id.clone()))?;
        let changed = state.unread_count != count;
        state.unread_count = count;
        Some(changed)
    }

    /// Reinstate a persisted row, replacing any in-memory one.
    pub fn restore(&mut self, state: ChatReadState) {
        self.states.insert((state.user_id.clone(), state.chat_id.clone()), state);
    }

    /// Every row for one chat.
    pub fn states_for_chat<'a>(
        &'a self,
        chat_id: &'a ChatId,
    ) -> impl Iterator<Item = &'a ChatReadState> {
        self.states.values().filter(move |state| &state.chat_id == chat_id)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no rows exist.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Unread messages for `user_id` in `chat_id`.
///
/// Counts messages in the chat that `user_id` did not write, that are still
/// visible to them, and that are strictly newer than `watermark` (every such
/// message when there is no watermark). Malformed records are skipped.
pub fn compute_unread<'a>(
    user_id: &UserId,
    chat_id: &ChatId,
    watermark: Option<Timestamp>,
    messages: impl IntoIterator<Item = &'a Message>,
) -> u32 {
    let count = messages
        .into_iter()
        .filter(|message| &message.sender_id != user_id)
        .filter(|message| watermark.is_none_or(|watermark| message.created_at > watermark))
        .filter(|message| message.is_visible_to(user_id))
        .filter(|message| message.chat_id().is_ok_and(|id| &id == chat_id))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::GroupId;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn mid(id: &str) -> MessageId {
        MessageId::new(id).unwrap()
    }

    fn ts(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn direct_chat() -> ChatId {
        ChatId::direct(&user("alice"), &user("bob"))
    }

    #[test]
    fn later_watermark_wins_regardless_of_order() {
        let mut tracker = ReadStateTracker::new();

        let first = tracker.mark_seen(&user("bob"), &direct_chat(), &mid("m2"), ts(100)).unwrap();
        let second = tracker.mark_seen(&user("bob"), &direct_chat(), &mid("m1"), ts(50)).unwrap();

        assert_eq!(first, MarkSeen::Advanced { previous: None });
        assert_eq!(second, MarkSeen::Stale);
        let state = tracker.get(&user("bob"), &direct_chat()).unwrap();
        assert_eq!(state.last_seen_timestamp, Some(ts(100)));
        assert_eq!(state.last_seen_message_id, Some(mid("m2")));
    }

    #[test]
    fn equal_timestamp_is_stale() {
        let mut tracker = ReadStateTracker::new();
        tracker.mark_seen(&user("bob"), &direct_chat(), &mid("m1"), ts(10)).unwrap();

        let outcome = tracker.mark_seen(&user("bob"), &direct_chat(), &mid("m2"), ts(10)).unwrap();
        assert_eq!(outcome, MarkSeen::Stale);
    }

    #[test]
    fn mark_seen_fills_chat_metadata() {
        let mut tracker = ReadStateTracker::new();
        tracker.mark_seen(&user("bob"), &direct_chat(), &mid("m1"), ts(10)).unwrap();

        let state = tracker.get(&user("bob"), &direct_chat()).unwrap();
        assert_eq!(state.chat_type, ChatType::Direct);
        assert_eq!(state.target_id, "alice");
    }

    #[test]
    fn outsider_cannot_mark_direct_chat() {
        let mut tracker = ReadStateTracker::new();
        let err = tracker.mark_seen(&user("eve"), &direct_chat(), &mid("m1"), ts(10)).unwrap_err();

        assert!(matches!(err, CoreError::NotARecipient { .. }));
        assert!(tracker.is_empty());
    }

    #[test]
    fn open_chat_creates_once_and_refreshes_activity() {
        let mut tracker = ReadStateTracker::new();
        tracker.open_chat(&user("bob"), ChatType::Group, "team", ts(5)).unwrap();
        let state = tracker.open_chat(&user("bob"), ChatType::Group, "team", ts(9)).unwrap();

        assert_eq!(state.last_active_at, ts(9));
        assert_eq!(state.chat_id, ChatId::group(&GroupId::new("team").unwrap()));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn sync_unread_reports_changes() {
        let mut tracker = ReadStateTracker::new();
        assert_eq!(tracker.sync_unread(&user("bob"), &direct_chat(), 3), None);

        tracker.open_chat(&user("bob"), ChatType::Direct, "alice", ts(1)).unwrap();
        assert_eq!(tracker.sync_unread(&user("bob"), &direct_chat(), 3), Some(true));
        assert_eq!(tracker.sync_unread(&user("bob"), &direct_chat(), 3), Some(false));
    }

    fn from_alice(id: &str, at: u64) -> Message {
        Message::direct(mid(id), user("alice"), user("bob"), "x", ts(at))
    }

    #[test]
    fn unread_counts_strictly_newer_foreign_messages() {
        let messages = vec![
            from_alice("m1", 10),
            from_alice("m2", 20),
            from_alice("m3", 30),
            Message::direct(mid("m4"), user("bob"), user("alice"), "mine", ts(40)),
        ];

        assert_eq!(compute_unread(&user("bob"), &direct_chat(), None, &messages), 3);
        assert_eq!(compute_unread(&user("bob"), &direct_chat(), Some(ts(20)), &messages), 1);
        assert_eq!(compute_unread(&user("bob"), &direct_chat(), Some(ts(30)), &messages), 0);
    }

    #[test]
    fn unread_skips_deleted_and_other_chats() {
        let mut deleted = from_alice("m1", 10);
        deleted.delete_for_everyone(&user("alice"), ts(11)).unwrap();
        let other_chat = Message::direct(mid("m2"), user("carol"), user("bob"), "x", ts(12));
        let live = from_alice("m3", 13);

        let messages = [deleted, other_chat, live];
        assert_eq!(compute_unread(&user("bob"), &direct_chat(), None, &messages), 1);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut tracker = ReadStateTracker::new();
        tracker.mark_seen(&user("bob"), &direct_chat(), &mid("m1"), ts(10)).unwrap();
        let state = tracker.get(&user("bob"), &direct_chat()).unwrap().clone();

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["chatId"], "direct:alice:bob");
        assert_eq!(json["lastSeenTimestamp"], 10);

        let mut restored = ReadStateTracker::new();
        restored.restore(serde_json::from_value(json).unwrap());
        assert_eq!(restored.watermark(&user("bob"), &direct_chat()), Some(ts(10)));
    }
}
