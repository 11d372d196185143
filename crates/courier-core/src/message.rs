//! The message record and its author/viewer operations.
//!
//! A [`Message`] is the only record the relay stores and fans out. Its `text`
//! and `image` fields hold ciphertext once sealed (see [`crate::cipher`]), so
//! every operation here works on metadata and never needs a key. Edits are
//! the exception: the new body must be sealed by the caller before it is
//! applied.

use serde::{Deserialize, Serialize};

use crate::{
    error::CoreError,
    ids::{ChatId, GroupId, MessageId, Timestamp, UserId},
    status::{DeliveryStatus, Receipt, StatusCell},
};

/// Discriminant fixing which addressing field is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// One recipient (`receiverId`)
    Direct,
    /// All members of a group (`groupId`)
    Group,
}

/// Kind of attached media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Still image
    Image,
    /// Video clip
    Video,
    /// Arbitrary document
    Document,
    /// Animated gif
    Gif,
}

/// Who a deletion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteScope {
    /// Masked for every viewer; author only
    Everyone,
    /// Masked for the deleting viewer only
    Me,
}

/// One user's reaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    /// Reacting user
    pub user_id: UserId,
    /// Emoji, free-form
    pub emoji: String,
}

/// Validated addressing of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Direct message to one user
    Direct(UserId),
    /// Group message
    Group(GroupId),
}

/// Chat message record.
///
/// # Invariants
///
/// - Exactly one of `receiver_id`, `group_id` is set and `message_type` agrees
/// - `encryption_key_version` is set (and non-zero) iff `is_encrypted`
/// - `is_reply` iff `reply_to` is set
/// - `status` only moves forward (see [`crate::status`])
///
/// Group receipts are not part of the record; they live in
/// [`crate::delivery::ReceiptIndex`] and are attached on export through
/// [`Message::with_receipts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id
    pub id: MessageId,
    /// Author
    pub sender_id: UserId,
    /// Direct recipient
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    /// Group target
    #[serde(default)]
    pub group_id: Option<GroupId>,
    /// Which of `receiver_id`/`group_id` is set
    pub message_type: MessageType,
    /// Body, base64 envelope when encrypted
    pub text: String,
    /// Media reference, base64 envelope when encrypted
    #[serde(default)]
    pub image: Option<String>,
    /// Kind of `image`
    #[serde(default)]
    pub media_type: Option<MediaType>,
    /// Whether `text`/`image` are ciphertext
    #[serde(default)]
    pub is_encrypted: bool,
    /// Key version the ciphertext was sealed under
    #[serde(default)]
    pub encryption_key_version: Option<u32>,
    /// Direct delivery status; message-level status for groups
    #[serde(default)]
    pub status: DeliveryStatus,
    /// Direct recipient received it
    #[serde(default)]
    pub delivered_at: Option<Timestamp>,
    /// Direct recipient viewed it
    #[serde(default)]
    pub seen_at: Option<Timestamp>,
    /// Soft-delete flag
    #[serde(default)]
    pub is_deleted: bool,
    /// Scope of the deletion
    #[serde(default)]
    pub deleted_for: Option<DeleteScope>,
    /// Last user to delete it
    #[serde(default)]
    pub deleted_by: Option<UserId>,
    /// Viewers who deleted it for themselves
    #[serde(default)]
    pub deleted_for_users: Vec<UserId>,
    /// When it was deleted
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
    /// Whether the body was edited
    #[serde(default)]
    pub is_edited: bool,
    /// Last edit
    #[serde(default)]
    pub edited_at: Option<Timestamp>,
    /// Body before the first edit
    #[serde(default)]
    pub original_text: Option<String>,
    /// Reactions in insertion order, one per user
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// Parent message
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    /// Set together with `reply_to`
    #[serde(default)]
    pub is_reply: bool,
    /// Ephemeral status post this replies to
    #[serde(default)]
    pub status_reply_to: Option<String>,
    /// Creation time
    pub created_at: Timestamp,
}

impl Message {
    /// Unencrypted direct message in `Sending` state.
    pub fn direct(
        id: MessageId,
        sender_id: UserId,
        receiver_id: UserId,
        text: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self::blank(id, sender_id, Some(receiver_id), None, MessageType::Direct, text, created_at)
    }

    /// Unencrypted group message in `Sending` state.
    pub fn group(
        id: MessageId,
        sender_id: UserId,
        group_id: GroupId,
        text: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self::blank(id, sender_id, None, Some(group_id), MessageType::Group, text, created_at)
    }

    fn blank(
        id: MessageId,
        sender_id: UserId,
        receiver_id: Option<UserId>,
        group_id: Option<GroupId>,
        message_type: MessageType,
        text: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            sender_id,
            receiver_id,
            group_id,
            message_type,
            text: text.into(),
            image: None,
            media_type: None,
            is_encrypted: false,
            encryption_key_version: None,
            status: DeliveryStatus::Sending,
            delivered_at: None,
            seen_at: None,
            is_deleted: false,
            deleted_for: None,
            deleted_by: None,
            deleted_for_users: Vec::new(),
            deleted_at: None,
            is_edited: false,
            edited_at: None,
            original_text: None,
            reactions: Vec::new(),
            reply_to: None,
            is_reply: false,
            status_reply_to: None,
            created_at,
        }
    }

    /// Attach a media reference.
    #[must_use]
    pub fn with_media(mut self, image: impl Into<String>, media_type: MediaType) -> Self {
        self.image = Some(image.into());
        self.media_type = Some(media_type);
        self
    }

    /// Mark as a reply to `parent`.
    #[must_use]
    pub fn reply_to(mut self, parent: MessageId) -> Self {
        self.reply_to = Some(parent);
        self.is_reply = true;
        self
    }

    /// Link to the ephemeral status post being replied to.
    #[must_use]
    pub fn replying_to_status(mut self, status_id: impl Into<String>) -> Self {
        self.status_reply_to = Some(status_id.into());
        self
    }

    /// Check addressing and metadata invariants.
    ///
    /// # Errors
    ///
    /// - `InvalidAddressing` if both or neither target is set, or
    ///   `message_type` disagrees with the target
    /// - `InvalidRecord` if encryption or reply metadata is inconsistent
    pub fn validate(&self) -> Result<Target, CoreError> {
        let target = match (&self.receiver_id, &self.group_id, self.message_type) {
            (Some(receiver), None, MessageType::Direct) => Target::Direct(receiver.clone()),
            (None, Some(group), MessageType::Group) => Target::Group(group.clone()),
            (Some(_), Some(_), _) => {
                return Err(CoreError::InvalidAddressing { reason: "both targets set" });
            },
            (None, None, _) => {
                return Err(CoreError::InvalidAddressing { reason: "no target set" });
            },
            _ => {
                return Err(CoreError::InvalidAddressing {
                    reason: "message type does not match target",
                });
            },
        };

        match (self.is_encrypted, self.encryption_key_version) {
            (true, Some(0)) => {
                return Err(CoreError::InvalidRecord { reason: "key version 0" });
            },
            (true, None) => {
                return Err(CoreError::InvalidRecord { reason: "encrypted without key version" });
            },
            (false, Some(_)) => {
                return Err(CoreError::InvalidRecord { reason: "key version on plaintext" });
            },
            _ => {},
        }

        if self.is_reply != self.reply_to.is_some() {
            return Err(CoreError::InvalidRecord { reason: "reply flag disagrees with replyTo" });
        }
        if self.image.is_none() && self.media_type.is_some() {
            return Err(CoreError::InvalidRecord { reason: "media type without media" });
        }

        Ok(target)
    }

    /// Canonical chat this message belongs to.
    ///
    /// # Errors
    ///
    /// - `InvalidAddressing` if the record is not addressed correctly
    pub fn chat_id(&self) -> Result<ChatId, CoreError> {
        Ok(match self.validate()? {
            Target::Direct(receiver) => ChatId::direct(&self.sender_id, &receiver),
            Target::Group(group) => ChatId::group(&group),
        })
    }

    /// Mask the content for every viewer. Author only; idempotent.
    ///
    /// Returns whether the record changed.
    ///
    /// # Errors
    ///
    /// - `NotAuthor` if `actor` did not write the message
    pub fn delete_for_everyone(&mut self, actor: &UserId, at: Timestamp) -> Result<bool, CoreError> {
        self.require_author(actor)?;
        if self.deleted_for == Some(DeleteScope::Everyone) {
            return Ok(false);
        }

        self.is_deleted = true;
        self.deleted_for = Some(DeleteScope::Everyone);
        self.deleted_by = Some(actor.clone());
        self.deleted_at = Some(at);
        Ok(true)
    }

    /// Mask the content for `actor` only.
    ///
    /// Each participant hides the message independently. Never downgrades a
    /// delete-for-everyone. Returns whether the record changed.
    pub fn delete_for_me(&mut self, actor: &UserId, at: Timestamp) -> bool {
        if self.deleted_for == Some(DeleteScope::Everyone) || self.is_deleted_by(actor) {
            return false;
        }

        self.is_deleted = true;
        self.deleted_for = Some(DeleteScope::Me);
        self.deleted_by = Some(actor.clone());
        self.deleted_for_users.push(actor.clone());
        self.deleted_at = Some(at);
        true
    }

    /// Replace the body. Author only, and never once the author can no
    /// longer see it (deleted for everyone, or deleted by the author for
    /// themselves).
    ///
    /// The first edit keeps the pre-edit body in `original_text`; later edits
    /// leave it alone. `text` must already be sealed when the message is
    /// encrypted.
    ///
    /// # Errors
    ///
    /// - `NotAuthor` if `actor` did not write the message
    /// - `MessageDeleted` if the message is masked for the author
    pub fn edit(
        &mut self,
        actor: &UserId,
        text: impl Into<String>,
        at: Timestamp,
    ) -> Result<(), CoreError> {
        self.require_author(actor)?;
        if !self.is_visible_to(actor) {
            return Err(CoreError::MessageDeleted(self.id.clone()));
        }

        let previous = std::mem::replace(&mut self.text, text.into());
        if self.original_text.is_none() {
            self.original_text = Some(previous);
        }
        self.is_edited = true;
        self.edited_at = Some(at);
        Ok(())
    }

    /// Set `user`'s reaction, replacing any earlier one in place.
    pub fn react(&mut self, user: &UserId, emoji: impl Into<String>) {
        let emoji = emoji.into();
        match self.reactions.iter_mut().find(|r| &r.user_id == user) {
            Some(existing) => existing.emoji = emoji,
            None => self.reactions.push(Reaction { user_id: user.clone(), emoji }),
        }
    }

    /// Remove `user`'s reaction. Returns whether one existed.
    pub fn unreact(&mut self, user: &UserId) -> bool {
        let before = self.reactions.len();
        self.reactions.retain(|r| &r.user_id != user);
        self.reactions.len() != before
    }

    /// Whether `viewer` still sees the content.
    pub fn is_visible_to(&self, viewer: &UserId) -> bool {
        match self.deleted_for {
            None => true,
            Some(DeleteScope::Everyone) => false,
            Some(DeleteScope::Me) => !self.is_deleted_by(viewer),
        }
    }

    /// Whether `viewer` deleted the message for themselves.
    ///
    /// Records stored before `deleted_for_users` existed only carry
    /// `deleted_by`.
    fn is_deleted_by(&self, viewer: &UserId) -> bool {
        self.deleted_for_users.contains(viewer)
            || (self.deleted_for == Some(DeleteScope::Me)
                && self.deleted_by.as_ref() == Some(viewer))
    }

    /// The body as `viewer` sees it, or `None` when masked.
    pub fn visible_text(&self, viewer: &UserId) -> Option<&str> {
        self.is_visible_to(viewer).then_some(self.text.as_str())
    }

    /// Message-level status with its timestamps.
    pub fn status_cell(&self) -> StatusCell {
        StatusCell { status: self.status, delivered_at: self.delivered_at, seen_at: self.seen_at }
    }

    /// Overwrite the message-level status with `cell`.
    pub fn set_status_cell(&mut self, cell: StatusCell) {
        self.status = cell.status;
        self.delivered_at = cell.delivered_at;
        self.seen_at = cell.seen_at;
    }

    /// Export with receipts attached as `readBy`.
    pub fn with_receipts(self, read_by: Vec<Receipt>) -> MessageWithReceipts {
        MessageWithReceipts { message: self, read_by }
    }

    fn require_author(&self, actor: &UserId) -> Result<(), CoreError> {
        if &self.sender_id == actor {
            Ok(())
        } else {
            Err(CoreError::NotAuthor { message_id: self.id.clone(), user_id: actor.clone() })
        }
    }
}

/// A message with its group receipts, in export shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageWithReceipts {
    /// The record
    #[serde(flatten)]
    pub message: Message,
    /// Receipts in insertion order
    #[serde(default)]
    pub read_by: Vec<Receipt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn direct() -> Message {
        Message::direct(
            MessageId::new("m1").unwrap(),
            user("alice"),
            user("bob"),
            "hi",
            Timestamp::from_millis(1),
        )
    }

    fn group() -> Message {
        Message::group(
            MessageId::new("m2").unwrap(),
            user("alice"),
            GroupId::new("team").unwrap(),
            "hello team",
            Timestamp::from_millis(1),
        )
    }

    #[test]
    fn valid_messages_report_target() {
        assert_eq!(direct().validate().unwrap(), Target::Direct(user("bob")));
        assert_eq!(group().validate().unwrap(), Target::Group(GroupId::new("team").unwrap()));
    }

    #[test]
    fn both_targets_rejected() {
        let mut message = direct();
        message.group_id = Some(GroupId::new("team").unwrap());

        assert!(matches!(message.validate(), Err(CoreError::InvalidAddressing { .. })));
    }

    #[test]
    fn mismatched_type_rejected() {
        let mut message = direct();
        message.message_type = MessageType::Group;

        assert!(matches!(message.validate(), Err(CoreError::InvalidAddressing { .. })));
    }

    #[test]
    fn missing_target_rejected() {
        let mut message = direct();
        message.receiver_id = None;

        assert!(matches!(message.validate(), Err(CoreError::InvalidAddressing { .. })));
    }

    #[test]
    fn encryption_metadata_must_agree() {
        let mut message = direct();
        message.is_encrypted = true;
        assert!(matches!(message.validate(), Err(CoreError::InvalidRecord { .. })));

        message.encryption_key_version = Some(0);
        assert!(matches!(message.validate(), Err(CoreError::InvalidRecord { .. })));

        message.encryption_key_version = Some(1);
        assert!(message.validate().is_ok());

        message.is_encrypted = false;
        assert!(matches!(message.validate(), Err(CoreError::InvalidRecord { .. })));
    }

    #[test]
    fn reply_sets_both_fields() {
        let message = direct().reply_to(MessageId::new("parent").unwrap());

        assert!(message.is_reply);
        assert!(message.validate().is_ok());
    }

    #[test]
    fn status_reply_survives_the_wire() {
        let message = direct()
            .reply_to(MessageId::new("parent").unwrap())
            .replying_to_status("story-7");

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["statusReplyTo"], "story-7");
        assert_eq!(json["replyTo"], "parent");
        assert_eq!(json["isReply"], true);

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
        assert!(back.validate().is_ok());
    }

    #[test]
    fn direct_chat_id_matches_both_participants() {
        let message = direct();
        assert_eq!(message.chat_id().unwrap(), ChatId::direct(&user("bob"), &user("alice")));
    }

    #[test]
    fn only_author_deletes_for_everyone() {
        let mut message = direct();

        assert!(matches!(
            message.delete_for_everyone(&user("bob"), Timestamp::from_millis(5)),
            Err(CoreError::NotAuthor { .. })
        ));
        assert!(message.delete_for_everyone(&user("alice"), Timestamp::from_millis(5)).unwrap());
        assert!(!message.delete_for_everyone(&user("alice"), Timestamp::from_millis(6)).unwrap());
        assert_eq!(message.deleted_at, Some(Timestamp::from_millis(5)));
        assert_eq!(message.visible_text(&user("alice")), None);
        assert_eq!(message.visible_text(&user("bob")), None);
    }

    #[test]
    fn delete_for_me_masks_only_that_viewer() {
        let mut message = group();
        assert!(message.delete_for_me(&user("carol"), Timestamp::from_millis(2)));

        assert_eq!(message.visible_text(&user("carol")), None);
        assert_eq!(message.visible_text(&user("dave")), Some("hello team"));
    }

    #[test]
    fn both_ends_can_delete_for_themselves() {
        let mut message = direct();
        assert!(message.delete_for_me(&user("bob"), Timestamp::from_millis(2)));
        assert!(message.delete_for_me(&user("alice"), Timestamp::from_millis(3)));
        assert!(!message.delete_for_me(&user("alice"), Timestamp::from_millis(4)));

        assert_eq!(message.visible_text(&user("alice")), None);
        assert_eq!(message.visible_text(&user("bob")), None);
        assert_eq!(message.deleted_for_users, vec![user("bob"), user("alice")]);
        assert_eq!(message.deleted_at, Some(Timestamp::from_millis(3)));
    }

    #[test]
    fn legacy_delete_for_me_still_masks_its_viewer() {
        let message: Message = serde_json::from_str(
            r#"{"id":"m9","senderId":"a","receiverId":"b","messageType":"direct","text":"x",
                "isDeleted":true,"deletedFor":"me","deletedBy":"b","createdAt":7}"#,
        )
        .unwrap();

        assert!(message.deleted_for_users.is_empty());
        assert!(!message.is_visible_to(&user("b")));
        assert!(message.is_visible_to(&user("a")));
    }

    #[test]
    fn delete_for_everyone_supersedes_delete_for_me() {
        let mut message = direct();
        message.delete_for_me(&user("bob"), Timestamp::from_millis(2));
        message.delete_for_everyone(&user("alice"), Timestamp::from_millis(3)).unwrap();

        assert_eq!(message.deleted_for, Some(DeleteScope::Everyone));
        assert!(!message.delete_for_me(&user("bob"), Timestamp::from_millis(4)));
        assert_eq!(message.deleted_for, Some(DeleteScope::Everyone));
    }

    #[test]
    fn first_edit_keeps_original() {
        let mut message = direct();
        message.edit(&user("alice"), "hi there", Timestamp::from_millis(2)).unwrap();
        message.edit(&user("alice"), "hello", Timestamp::from_millis(3)).unwrap();

        assert_eq!(message.text, "hello");
        assert_eq!(message.original_text.as_deref(), Some("hi"));
        assert_eq!(message.edited_at, Some(Timestamp::from_millis(3)));
        assert!(message.is_edited);
    }

    #[test]
    fn edit_requires_author_and_live_message() {
        let mut message = direct();
        assert!(matches!(
            message.edit(&user("bob"), "x", Timestamp::from_millis(2)),
            Err(CoreError::NotAuthor { .. })
        ));

        message.delete_for_everyone(&user("alice"), Timestamp::from_millis(3)).unwrap();
        assert!(matches!(
            message.edit(&user("alice"), "x", Timestamp::from_millis(4)),
            Err(CoreError::MessageDeleted(_))
        ));
    }

    #[test]
    fn author_cannot_edit_after_hiding_own_message() {
        let mut message = direct();
        message.delete_for_me(&user("bob"), Timestamp::from_millis(2));
        message.edit(&user("alice"), "still mine", Timestamp::from_millis(3)).unwrap();

        message.delete_for_me(&user("alice"), Timestamp::from_millis(4));
        assert!(matches!(
            message.edit(&user("alice"), "edited", Timestamp::from_millis(5)),
            Err(CoreError::MessageDeleted(_))
        ));
        assert_eq!(message.text, "still mine");
    }

    #[test]
    fn reactions_are_last_write_wins() {
        let mut message = group();
        message.react(&user("bob"), "👍");
        message.react(&user("carol"), "🎉");
        message.react(&user("bob"), "❤️");

        assert_eq!(message.reactions.len(), 2);
        assert_eq!(message.reactions[0].user_id, user("bob"));
        assert_eq!(message.reactions[0].emoji, "❤️");

        assert!(message.unreact(&user("bob")));
        assert!(!message.unreact(&user("bob")));
        assert_eq!(message.reactions.len(), 1);
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let json = serde_json::to_value(direct().with_media("ref", MediaType::Gif)).unwrap();

        assert_eq!(json["senderId"], "alice");
        assert_eq!(json["receiverId"], "bob");
        assert_eq!(json["messageType"], "direct");
        assert_eq!(json["mediaType"], "gif");
        assert_eq!(json["status"], "sending");
        assert_eq!(json["isEncrypted"], false);
    }

    #[test]
    fn export_flattens_receipts() {
        let receipt = Receipt::new(user("bob"), StatusCell::new(DeliveryStatus::Delivered));
        let json = serde_json::to_value(group().with_receipts(vec![receipt])).unwrap();

        assert_eq!(json["groupId"], "team");
        assert_eq!(json["readBy"][0]["userId"], "bob");
        assert_eq!(json["readBy"][0]["status"], "delivered");
    }

    #[test]
    fn minimal_record_deserializes() {
        let message: Message = serde_json::from_str(
            r#"{"id":"m9","senderId":"a","receiverId":"b","messageType":"direct","text":"x","createdAt":7}"#,
        )
        .unwrap();

        assert_eq!(message.status, DeliveryStatus::Sending);
        assert!(message.validate().is_ok());
    }
}
