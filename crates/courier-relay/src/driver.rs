//! Relay driver.
//!
//! Ties together the group directory, the delivery state machine, the
//! read-state tracker and storage. The driver never touches the network or the
//! disk: every event returns the [`RelayAction`]s the runtime should execute.
//!
//! The relay only sees ciphertext. It acknowledges submissions, fans them out,
//! keeps receipts and read state, and authorizes group key rotation.

use std::collections::HashMap;

use courier_core::{
    ChatId, ChatKind, ChatReadState, ChatType, CoreError, DeleteScope, DeliveryAction,
    DeliveryStateMachine, DeliveryStatus, Environment, GroupId, MarkSeen, Message, MessageId,
    MessageWithReceipts, ReadStateTracker, Receipt, StatusCell, StatusEvent, StatusNotification,
    Target, Timestamp, UserId, chat_id_for, compute_unread,
};
use serde::{Deserialize, Serialize};

use crate::{
    directory::{GroupDirectory, GroupRecord, Role},
    error::RelayError,
    storage::Storage,
};

/// Relay configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Maximum members per group, owner included
    pub max_group_size: usize,
    /// Send `UnreadChanged` to recipients whenever their unread count moves
    pub emit_unread_deltas: bool,
    /// Also deliver an actor's own messages and updates back to them
    pub echo_to_sender: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { max_group_size: 256, emit_unread_deltas: true, echo_to_sender: false }
    }
}

/// Events that the relay driver processes.
///
/// Produced by the runtime from client requests (or replayed from NDJSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayEvent {
    /// Create a group; the owner joins as `Owner`, `members` as `Member`
    GroupCreated {
        /// New group
        group_id: GroupId,
        /// Creator
        owner: UserId,
        /// Initial members
        #[serde(default)]
        members: Vec<UserId>,
    },

    /// A user joined a group
    MemberJoined {
        /// Group
        group_id: GroupId,
        /// Joining user
        user_id: UserId,
        /// Role granted; never `Owner`
        #[serde(default)]
        role: Role,
    },

    /// A user left a group
    MemberLeft {
        /// Group
        group_id: GroupId,
        /// Leaving user
        user_id: UserId,
    },

    /// A client submitted a sealed message
    MessageSubmitted {
        /// The record as composed by the author
        message: Message,
    },

    /// Delivery status report from a recipient, the author or the transport
    StatusReported {
        /// Message the report is about
        message_id: MessageId,
        /// Reporter, `None` for transport reports
        #[serde(default)]
        acting_user_id: Option<UserId>,
        /// Reported status
        status: DeliveryStatus,
        /// When it happened
        at: Timestamp,
    },

    /// A user opened a chat
    ChatOpened {
        /// Viewer
        user_id: UserId,
        /// Kind of chat
        chat_type: ChatType,
        /// Other participant or group id
        target_id: String,
    },

    /// A user confirmed seeing a chat up to a message
    MarkSeen {
        /// Reader
        user_id: UserId,
        /// Chat
        chat_id: ChatId,
        /// Newest message seen
        message_id: MessageId,
        /// When
        at: Timestamp,
    },

    /// Owner or admin asked for a new group key
    RotateGroupKey {
        /// Group
        group_id: GroupId,
        /// Requester
        requested_by: UserId,
    },

    /// Delete a message for everyone or for the actor only
    MessageDeleted {
        /// Message
        message_id: MessageId,
        /// Actor
        user_id: UserId,
        /// Who stops seeing it
        scope: DeleteScope,
    },

    /// Author replaced the body (already sealed for encrypted messages)
    MessageEdited {
        /// Message
        message_id: MessageId,
        /// Actor
        user_id: UserId,
        /// New body
        text: String,
        /// When
        at: Timestamp,
    },

    /// Set (`Some`) or clear (`None`) the actor's reaction
    ReactionSet {
        /// Message
        message_id: MessageId,
        /// Actor
        user_id: UserId,
        /// Reaction
        #[serde(default)]
        emoji: Option<String>,
    },
}

impl RelayEvent {
    /// The user the event acts for, who receives any rejection.
    pub fn actor(&self) -> Option<&UserId> {
        match self {
            Self::GroupCreated { owner, .. } => Some(owner),
            Self::MemberJoined { user_id, .. }
            | Self::MemberLeft { user_id, .. }
            | Self::ChatOpened { user_id, .. }
            | Self::MarkSeen { user_id, .. }
            | Self::MessageDeleted { user_id, .. }
            | Self::MessageEdited { user_id, .. }
            | Self::ReactionSet { user_id, .. } => Some(user_id),
            Self::MessageSubmitted { message } => Some(&message.sender_id),
            Self::StatusReported { acting_user_id, .. } => acting_user_id.as_ref(),
            Self::RotateGroupKey { requested_by, .. } => Some(requested_by),
        }
    }

    /// The message the event refers to, if any.
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::MessageSubmitted { message } => Some(&message.id),
            Self::StatusReported { message_id, .. }
            | Self::MarkSeen { message_id, .. }
            | Self::MessageDeleted { message_id, .. }
            | Self::MessageEdited { message_id, .. }
            | Self::ReactionSet { message_id, .. } => Some(message_id),
            Self::GroupCreated { .. }
            | Self::MemberJoined { .. }
            | Self::MemberLeft { .. }
            | Self::ChatOpened { .. }
            | Self::RotateGroupKey { .. } => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::GroupCreated { .. } => "group creation",
            Self::MemberJoined { .. } => "join",
            Self::MemberLeft { .. } => "leave",
            Self::MessageSubmitted { .. } => "submission",
            Self::StatusReported { .. } => "status report",
            Self::ChatOpened { .. } => "chat open",
            Self::MarkSeen { .. } => "mark-seen",
            Self::RotateGroupKey { .. } => "key rotation",
            Self::MessageDeleted { .. } => "delete",
            Self::MessageEdited { .. } => "edit",
            Self::ReactionSet { .. } => "reaction",
        }
    }
}

/// Events the relay pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutboundEvent {
    /// A message addressed to the client
    NewMessage {
        /// The sealed record
        message: Message,
    },
    /// The relay accepted the client's submission (`Sending -> Sent`)
    Ack {
        /// Accepted message
        message_id: MessageId,
        /// Acceptance time
        at: Timestamp,
    },
    /// A status transition on one of the client's messages
    Status(StatusNotification),
    /// The aggregate of one of the client's group messages moved
    AggregateStatus {
        /// Group message
        message_id: MessageId,
        /// New aggregate
        status: DeliveryStatus,
    },
    /// A group's key was rotated
    KeyRotated {
        /// Group
        group_id: GroupId,
        /// New version
        version: u32,
    },
    /// The client became a member of a group
    GroupJoined {
        /// Group
        group_id: GroupId,
        /// Current key version
        key_version: u32,
    },
    /// The client's unread count for a chat
    UnreadChanged {
        /// Chat
        chat_id: ChatId,
        /// Unread messages
        unread_count: u32,
    },
    /// A message was edited, deleted or reacted to
    MessageUpdated {
        /// The record after the change
        message: Message,
    },
    /// The client's request was refused
    Rejected {
        /// Human-readable cause
        reason: String,
        /// Message the request referred to
        message_id: Option<MessageId>,
    },
}

/// Actions that the relay driver produces.
///
/// Executed by runtime-specific code (the replay binary or the simulation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayAction {
    /// Push an event to a user
    Deliver {
        /// Recipient
        to: UserId,
        /// Event
        event: OutboundEvent,
    },

    /// Persist a message record
    PersistMessage {
        /// Record after the change
        message: Message,
    },

    /// Persist one member's receipt row
    PersistReceipt {
        /// Group message
        message_id: MessageId,
        /// Row after the change
        receipt: Receipt,
    },

    /// Persist a read-state row
    PersistReadState {
        /// Row after the change
        state: ChatReadState,
    },

    /// Persist a group directory record
    PersistGroup {
        /// Record after the change
        group: GroupRecord,
    },

    /// Log a message (for debugging/monitoring)
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
        /// When the event occurred
        at: Timestamp,
    },
}

/// Log levels for relay actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// What [`RelayDriver::recover`] reinstated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Group records
    pub groups: usize,
    /// Message records
    pub messages: usize,
    /// Receipt rows
    pub receipts: usize,
    /// Read-state rows
    pub read_states: usize,
}

/// Action-based relay driver.
pub struct RelayDriver<E, S>
where
    E: Environment,
    S: Storage,
{
    /// Environment (time)
    env: E,
    /// Storage backend, read only during recovery
    storage: S,
    /// Relay configuration
    config: RelayConfig,
    /// Groups, members and key versions
    directory: GroupDirectory,
    /// Message status and group receipts
    delivery: DeliveryStateMachine,
    /// Per-user watermarks
    read_state: ReadStateTracker,
    /// Message records by id
    messages: HashMap<MessageId, Message>,
    /// Message ids per chat, in submission order
    chats: HashMap<ChatId, Vec<MessageId>>,
}

impl<E, S> RelayDriver<E, S>
where
    E: Environment,
    S: Storage,
{
    /// Create a new relay driver with empty state.
    pub fn new(env: E, storage: S, config: RelayConfig) -> Self {
        Self {
            env,
            storage,
            directory: GroupDirectory::new(config.max_group_size),
            config,
            delivery: DeliveryStateMachine::new(),
            read_state: ReadStateTracker::new(),
            messages: HashMap::new(),
            chats: HashMap::new(),
        }
    }

    /// Process a relay event and return actions to execute.
    ///
    /// Never fails: a refused event yields a `Rejected` event for its actor and
    /// a warning, and leaves every other message and chat untouched.
    pub fn process_event(&mut self, event: RelayEvent) -> Vec<RelayAction> {
        let name = event.name();
        let actor = event.actor().cloned();
        let message_id = event.message_id().cloned();

        match self.handle_event(event) {
            Ok(actions) => actions,
            Err(err) => self.reject(name, actor, message_id, &err),
        }
    }

    fn handle_event(&mut self, event: RelayEvent) -> Result<Vec<RelayAction>, RelayError> {
        match event {
            RelayEvent::GroupCreated { group_id, owner, members } => {
                self.handle_group_created(&group_id, &owner, &members)
            },
            RelayEvent::MemberJoined { group_id, user_id, role } => {
                self.handle_member_joined(&group_id, &user_id, role)
            },
            RelayEvent::MemberLeft { group_id, user_id } => {
                self.handle_member_left(&group_id, &user_id)
            },
            RelayEvent::MessageSubmitted { message } => self.handle_submit(message),
            RelayEvent::StatusReported { message_id, acting_user_id, status, at } => {
                self.handle_status_report(&StatusEvent { message_id, acting_user_id, status, at })
            },
            RelayEvent::ChatOpened { user_id, chat_type, target_id } => {
                self.handle_chat_opened(&user_id, chat_type, &target_id)
            },
            RelayEvent::MarkSeen { user_id, chat_id, message_id, at } => {
                self.handle_mark_seen(&user_id, &chat_id, &message_id, at)
            },
            RelayEvent::RotateGroupKey { group_id, requested_by } => {
                self.handle_rotate(&group_id, &requested_by)
            },
            RelayEvent::MessageDeleted { message_id, user_id, scope } => {
                self.handle_delete(&message_id, &user_id, scope)
            },
            RelayEvent::MessageEdited { message_id, user_id, text, at } => {
                self.handle_edit(&message_id, &user_id, text, at)
            },
            RelayEvent::ReactionSet { message_id, user_id, emoji } => {
                self.handle_reaction(&message_id, &user_id, emoji)
            },
        }
    }

    fn reject(
        &self,
        name: &str,
        actor: Option<UserId>,
        message_id: Option<MessageId>,
        err: &RelayError,
    ) -> Vec<RelayAction> {
        let mut actions = Vec::with_capacity(2);
        if let Some(to) = actor {
            actions.push(RelayAction::Deliver {
                to,
                event: OutboundEvent::Rejected { reason: err.to_string(), message_id },
            });
        }
        actions.push(self.log(LogLevel::Warn, format!("{name} rejected: {err}")));
        actions
    }

    fn handle_group_created(
        &mut self,
        group_id: &GroupId,
        owner: &UserId,
        members: &[UserId],
    ) -> Result<Vec<RelayAction>, RelayError> {
        let at = self.env.now();
        let record = self.directory.create(group_id, owner, members, at)?.clone();

        let mut actions = vec![RelayAction::PersistGroup { group: record.clone() }];
        for member in record.members.keys() {
            actions.push(deliver(member, OutboundEvent::GroupJoined {
                group_id: group_id.clone(),
                key_version: record.key_version,
            }));
        }
        actions.push(self.log(
            LogLevel::Info,
            format!("group {group_id} created by {owner} with {} members", record.members.len()),
        ));
        Ok(actions)
    }

    fn handle_member_joined(
        &mut self,
        group_id: &GroupId,
        user_id: &UserId,
        role: Role,
    ) -> Result<Vec<RelayAction>, RelayError> {
        if !self.directory.join(group_id, user_id, role)? {
            return Ok(vec![self.log(LogLevel::Debug, format!("{user_id} already in {group_id}"))]);
        }

        let record = self.directory.get(group_id)?.clone();
        let mut actions = vec![
            RelayAction::PersistGroup { group: record.clone() },
            deliver(user_id, OutboundEvent::GroupJoined {
                group_id: group_id.clone(),
                key_version: record.key_version,
            }),
        ];
        self.refresh_unread(user_id, &ChatId::group(group_id), &mut actions);
        Ok(actions)
    }

    fn handle_member_left(
        &mut self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Vec<RelayAction>, RelayError> {
        if !self.directory.leave(group_id, user_id)? {
            return Ok(vec![self.log(LogLevel::Debug, format!("{user_id} not in {group_id}"))]);
        }

        let record = self.directory.get(group_id)?.clone();
        Ok(vec![RelayAction::PersistGroup { group: record }])
    }

    /// Accept a submission: validate, ack, create receipt rows, fan out.
    ///
    /// The relay is authoritative for status; whatever the client put in the
    /// record is replaced by `Sending` before tracking and `Sent` after the
    /// ack.
    fn handle_submit(&mut self, mut message: Message) -> Result<Vec<RelayAction>, RelayError> {
        let target = message.validate()?;
        if self.messages.contains_key(&message.id) {
            return Err(CoreError::DuplicateMessage(message.id.clone()).into());
        }
        let chat_id = message.chat_id()?;

        let recipients: Vec<UserId> = match &target {
            Target::Direct(receiver) => vec![receiver.clone()],
            Target::Group(group_id) => {
                self.directory.require_member(group_id, &message.sender_id)?;
                let group = self.directory.get(group_id)?;
                if let Some(version) =
                    message.encryption_key_version.filter(|version| *version > group.key_version)
                {
                    return Err(RelayError::UnannouncedVersion {
                        group_id: group_id.clone(),
                        version,
                    });
                }
                group.members.keys().filter(|member| **member != message.sender_id).cloned().collect()
            },
        };

        let at = self.env.now();
        // Sender clocks may run ahead of the relay
        message.created_at = message.created_at.min(at);
        message.set_status_cell(StatusCell::new(DeliveryStatus::Sending));
        self.delivery.track(&message, recipients.iter().cloned())?;
        self.delivery.advance(&StatusEvent {
            message_id: message.id.clone(),
            acting_user_id: None,
            status: DeliveryStatus::Sent,
            at,
        })?;
        if let Some(cell) = self.delivery.message_cell(&message.id) {
            message.set_status_cell(cell);
        }

        let message_id = message.id.clone();
        let sender = message.sender_id.clone();

        let mut actions = vec![RelayAction::PersistMessage { message: message.clone() }];
        for receipt in self.delivery.receipts(&message_id) {
            actions.push(RelayAction::PersistReceipt { message_id: message_id.clone(), receipt });
        }
        actions.push(deliver(&sender, OutboundEvent::Ack { message_id: message_id.clone(), at }));
        for recipient in &recipients {
            actions.push(deliver(recipient, OutboundEvent::NewMessage { message: message.clone() }));
        }
        if self.config.echo_to_sender && !recipients.contains(&sender) {
            actions.push(deliver(&sender, OutboundEvent::NewMessage { message: message.clone() }));
        }

        self.chats.entry(chat_id.clone()).or_default().push(message_id.clone());
        self.messages.insert(message_id.clone(), message);

        for recipient in &recipients {
            self.refresh_unread(recipient, &chat_id, &mut actions);
        }
        actions.push(self.log(
            LogLevel::Debug,
            format!("message {message_id} from {sender} sent to {} recipients", recipients.len()),
        ));
        Ok(actions)
    }

    fn handle_status_report(&mut self, event: &StatusEvent) -> Result<Vec<RelayAction>, RelayError> {
        let actions = self.apply_status(event)?;
        if actions.is_empty() {
            return Ok(vec![self.log(
                LogLevel::Debug,
                format!("stale {:?} for {} ignored", event.status, event.message_id),
            )]);
        }
        Ok(actions)
    }

    /// Apply a transition and persist whatever it moved.
    ///
    /// Returns no actions for a stale transition.
    fn apply_status(&mut self, event: &StatusEvent) -> Result<Vec<RelayAction>, RelayError> {
        let notifications = self.delivery.advance(event)?;
        if notifications.is_empty() {
            return Ok(Vec::new());
        }

        let mut actions = Vec::with_capacity(notifications.len() + 1);
        let receipt = event
            .acting_user_id
            .as_ref()
            .and_then(|member| self.delivery.receipt(&event.message_id, member));
        match receipt {
            Some(receipt) => {
                actions.push(RelayAction::PersistReceipt {
                    message_id: event.message_id.clone(),
                    receipt,
                });
            },
            None => {
                if let (Some(message), Some(cell)) = (
                    self.messages.get_mut(&event.message_id),
                    self.delivery.message_cell(&event.message_id),
                ) {
                    message.set_status_cell(cell);
                    actions.push(RelayAction::PersistMessage { message: message.clone() });
                }
            },
        }

        actions.extend(notifications.into_iter().map(|notification| match notification {
            DeliveryAction::Notify { to, notification } => {
                RelayAction::Deliver { to, event: OutboundEvent::Status(notification) }
            },
            DeliveryAction::AggregateChanged { to, message_id, status } => RelayAction::Deliver {
                to,
                event: OutboundEvent::AggregateStatus { message_id, status },
            },
        }));
        Ok(actions)
    }

    fn handle_chat_opened(
        &mut self,
        user_id: &UserId,
        chat_type: ChatType,
        target_id: &str,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let chat_id = chat_id_for(chat_type, user_id, target_id).map_err(CoreError::from)?;
        self.require_chat_access(user_id, &chat_id)?;

        let at = self.env.now();
        self.read_state.open_chat(user_id, chat_type, target_id, at)?;

        let mut actions = Vec::new();
        self.publish_unread(user_id, &chat_id, &mut actions);
        Ok(actions)
    }

    /// Move the reader's watermark and mark everything it covers as seen.
    ///
    /// The watermark never lands before the referenced message, so a reader
    /// whose clock lags still clears it from their unread count. The
    /// referenced message and every other message in the chat created no
    /// later than the watermark advance to `Seen` for the reader. Messages
    /// the reader was never a recipient of (joined the group later) are
    /// skipped.
    fn handle_mark_seen(
        &mut self,
        user_id: &UserId,
        chat_id: &ChatId,
        message_id: &MessageId,
        at: Timestamp,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let message = self
            .messages
            .get(message_id)
            .ok_or_else(|| CoreError::UnknownMessage(message_id.clone()))?;
        let at = at.max(message.created_at);
        if &message.chat_id()? != chat_id {
            return Err(CoreError::ChatMismatch {
                message_id: message_id.clone(),
                chat_id: chat_id.clone(),
            }
            .into());
        }
        self.require_chat_access(user_id, chat_id)?;

        if let MarkSeen::Stale = self.read_state.mark_seen(user_id, chat_id, message_id, at)? {
            return Ok(vec![self.log(
                LogLevel::Debug,
                format!("stale mark-seen by {user_id} in {chat_id} at {at}"),
            )]);
        }

        let covered: Vec<MessageId> = self
            .chat_messages(chat_id)
            .filter(|message| &message.sender_id != user_id)
            .filter(|message| message.created_at <= at || &message.id == message_id)
            .map(|message| message.id.clone())
            .collect();

        let mut actions = Vec::new();
        for id in covered {
            let event = StatusEvent {
                message_id: id,
                acting_user_id: Some(user_id.clone()),
                status: DeliveryStatus::Seen,
                at,
            };
            match self.apply_status(&event) {
                Ok(moved) => actions.extend(moved),
                Err(RelayError::Core(CoreError::NotARecipient { .. })) => {},
                Err(err) => actions.push(self.log(
                    LogLevel::Warn,
                    format!("seen bridge skipped {}: {err}", event.message_id),
                )),
            }
        }

        self.publish_unread(user_id, chat_id, &mut actions);
        Ok(actions)
    }

    fn handle_rotate(
        &mut self,
        group_id: &GroupId,
        requested_by: &UserId,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let version = self.directory.rotate(group_id, requested_by)?;
        let record = self.directory.get(group_id)?.clone();

        let mut actions = vec![RelayAction::PersistGroup { group: record.clone() }];
        for member in record.members.keys() {
            actions.push(deliver(member, OutboundEvent::KeyRotated {
                group_id: group_id.clone(),
                version,
            }));
        }
        actions.push(self.log(
            LogLevel::Info,
            format!("group {group_id} key rotated to v{version} by {requested_by}"),
        ));
        Ok(actions)
    }

    fn handle_delete(
        &mut self,
        message_id: &MessageId,
        user_id: &UserId,
        scope: DeleteScope,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let participants = self.require_participant(message_id, user_id)?;
        let at = self.env.now();

        let message = self.message_mut(message_id)?;
        let changed = match scope {
            DeleteScope::Everyone => message.delete_for_everyone(user_id, at)?,
            DeleteScope::Me => message.delete_for_me(user_id, at),
        };
        if !changed {
            return Ok(vec![self.log(
                LogLevel::Debug,
                format!("{message_id} already deleted, {user_id} request ignored"),
            )]);
        }
        let updated = message.clone();

        let audience = match scope {
            DeleteScope::Everyone => self.audience(&participants, user_id),
            DeleteScope::Me => vec![user_id.clone()],
        };
        let mut actions = self.publish_update(&updated, &audience);

        let chat_id = updated.chat_id()?;
        for participant in participants.iter().filter(|p| **p != updated.sender_id) {
            self.refresh_unread(participant, &chat_id, &mut actions);
        }
        Ok(actions)
    }

    fn handle_edit(
        &mut self,
        message_id: &MessageId,
        user_id: &UserId,
        text: String,
        at: Timestamp,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let participants = self.require_participant(message_id, user_id)?;

        let message = self.message_mut(message_id)?;
        message.edit(user_id, text, at)?;
        let updated = message.clone();

        let audience = self.audience(&participants, user_id);
        Ok(self.publish_update(&updated, &audience))
    }

    fn handle_reaction(
        &mut self,
        message_id: &MessageId,
        user_id: &UserId,
        emoji: Option<String>,
    ) -> Result<Vec<RelayAction>, RelayError> {
        let participants = self.require_participant(message_id, user_id)?;

        let message = self.message_mut(message_id)?;
        let changed = match emoji {
            Some(emoji) => {
                message.react(user_id, emoji);
                true
            },
            None => message.unreact(user_id),
        };
        if !changed {
            return Ok(vec![self.log(
                LogLevel::Debug,
                format!("{user_id} had no reaction on {message_id}"),
            )]);
        }
        let updated = message.clone();

        let audience = self.audience(&participants, user_id);
        Ok(self.publish_update(&updated, &audience))
    }

    /// Rebuild in-memory state from storage.
    ///
    /// Call once on a fresh driver before processing events. Messages already
    /// tracked are skipped. Cached unread counts are recomputed from the
    /// recovered messages.
    pub fn recover(&mut self) -> Result<RecoveryReport, RelayError> {
        let groups = self.storage.list_groups()?;
        let messages = self.storage.list_messages()?;
        let read_states = self.storage.list_read_states()?;

        let mut report = RecoveryReport::default();
        for group in groups {
            self.directory.restore(group);
            report.groups += 1;
        }

        for message in messages {
            if self.delivery.contains(&message.id) {
                continue;
            }
            let receipts = if message.group_id.is_some() {
                self.storage.load_receipts(&message.id)?
            } else {
                Vec::new()
            };
            self.delivery.restore(&message, &receipts)?;

            let chat_id = message.chat_id()?;
            self.chats.entry(chat_id).or_default().push(message.id.clone());
            self.messages.insert(message.id.clone(), message);
            report.messages += 1;
            report.receipts += receipts.len();
        }

        for state in read_states {
            self.read_state.restore(state);
            report.read_states += 1;
        }

        // Cached counts may predate the last persisted message
        let chat_ids: Vec<ChatId> = self.chats.keys().cloned().collect();
        for chat_id in chat_ids {
            let readers: Vec<UserId> = self
                .read_state
                .states_for_chat(&chat_id)
                .map(|state| state.user_id.clone())
                .collect();
            for user_id in readers {
                let count = self.unread_count(&user_id, &chat_id);
                self.read_state.sync_unread(&user_id, &chat_id, count);
            }
        }

        tracing::info!(
            groups = report.groups,
            messages = report.messages,
            receipts = report.receipts,
            read_states = report.read_states,
            "relay state recovered from storage"
        );
        Ok(report)
    }

    /// Storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Relay configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Group directory.
    pub fn directory(&self) -> &GroupDirectory {
        &self.directory
    }

    /// Delivery state machine.
    pub fn delivery(&self) -> &DeliveryStateMachine {
        &self.delivery
    }

    /// Read-state tracker.
    pub fn read_state(&self) -> &ReadStateTracker {
        &self.read_state
    }

    /// Message record as the relay holds it.
    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.get(message_id)
    }

    /// Status the author sees (group messages: the folded aggregate).
    pub fn status(&self, message_id: &MessageId) -> Option<DeliveryStatus> {
        self.delivery.status(message_id)
    }

    /// Message record with its receipts attached as `readBy`.
    pub fn export_message(&self, message_id: &MessageId) -> Option<MessageWithReceipts> {
        let message = self.messages.get(message_id)?.clone();
        Some(message.with_receipts(self.delivery.receipts(message_id)))
    }

    /// Unread messages for `user_id` in `chat_id`, computed from scratch.
    pub fn unread_count(&self, user_id: &UserId, chat_id: &ChatId) -> u32 {
        let watermark = self.read_state.watermark(user_id, chat_id);
        compute_unread(user_id, chat_id, watermark, self.chat_messages(chat_id))
    }

    fn chat_messages<'a>(&'a self, chat_id: &ChatId) -> impl Iterator<Item = &'a Message> {
        self.chats
            .get(chat_id)
            .into_iter()
            .flatten()
            .filter_map(|message_id| self.messages.get(message_id))
    }

    fn message_mut(&mut self, message_id: &MessageId) -> Result<&mut Message, RelayError> {
        self.messages
            .get_mut(message_id)
            .ok_or_else(|| CoreError::UnknownMessage(message_id.clone()).into())
    }

    /// Everyone who can see the message: both direct participants, or the
    /// group's current members plus the author.
    fn participants(&self, message: &Message) -> Result<Vec<UserId>, RelayError> {
        match message.validate()? {
            Target::Direct(receiver) => {
                let mut users = vec![message.sender_id.clone()];
                if receiver != message.sender_id {
                    users.push(receiver);
                }
                Ok(users)
            },
            Target::Group(group_id) => {
                let mut users = self.directory.members(&group_id)?;
                if !users.contains(&message.sender_id) {
                    users.push(message.sender_id.clone());
                }
                Ok(users)
            },
        }
    }

    fn require_participant(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Result<Vec<UserId>, RelayError> {
        let message = self
            .messages
            .get(message_id)
            .ok_or_else(|| CoreError::UnknownMessage(message_id.clone()))?;
        let participants = self.participants(message)?;
        if !participants.contains(user_id) {
            return Err(CoreError::NotARecipient {
                message_id: message_id.clone(),
                user_id: Some(user_id.clone()),
            }
            .into());
        }
        Ok(participants)
    }

    /// Group chats are only readable by current members. Direct chats are
    /// checked by the read-state tracker.
    fn require_chat_access(&self, user_id: &UserId, chat_id: &ChatId) -> Result<(), RelayError> {
        if let ChatKind::Group(group_id) = chat_id.kind().map_err(CoreError::from)? {
            self.directory.require_member(&group_id, user_id)?;
        }
        Ok(())
    }

    /// Recipients of an actor's change: everyone else, plus the actor when
    /// echoing is on.
    fn audience(&self, participants: &[UserId], actor: &UserId) -> Vec<UserId> {
        participants
            .iter()
            .filter(|user| self.config.echo_to_sender || *user != actor)
            .cloned()
            .collect()
    }

    fn publish_update(&self, message: &Message, audience: &[UserId]) -> Vec<RelayAction> {
        let mut actions = vec![RelayAction::PersistMessage { message: message.clone() }];
        for user in audience {
            actions.push(deliver(user, OutboundEvent::MessageUpdated { message: message.clone() }));
        }
        actions
    }

    /// Recompute a recipient's unread count; persist and notify only when it
    /// moved (or when the user has no row yet).
    fn refresh_unread(&mut self, user_id: &UserId, chat_id: &ChatId, actions: &mut Vec<RelayAction>) {
        let count = self.unread_count(user_id, chat_id);
        let changed = self.read_state.sync_unread(user_id, chat_id, count);

        if let (Some(true), Some(state)) = (changed, self.read_state.get(user_id, chat_id)) {
            actions.push(RelayAction::PersistReadState { state: state.clone() });
        }
        if self.config.emit_unread_deltas && changed != Some(false) {
            actions.push(deliver(user_id, OutboundEvent::UnreadChanged {
                chat_id: chat_id.clone(),
                unread_count: count,
            }));
        }
    }

    /// Recompute the reader's own count after they touched the chat; always
    /// persists the row and reports the count.
    fn publish_unread(&mut self, user_id: &UserId, chat_id: &ChatId, actions: &mut Vec<RelayAction>) {
        let count = self.unread_count(user_id, chat_id);
        self.read_state.sync_unread(user_id, chat_id, count);

        if let Some(state) = self.read_state.get(user_id, chat_id) {
            actions.push(RelayAction::PersistReadState { state: state.clone() });
        }
        if self.config.emit_unread_deltas {
            actions.push(deliver(user_id, OutboundEvent::UnreadChanged {
                chat_id: chat_id.clone(),
                unread_count: count,
            }));
        }
    }

    fn log(&self, level: LogLevel, message: String) -> RelayAction {
        RelayAction::Log { level, message, at: self.env.now() }
    }
}

fn deliver(to: &UserId, event: OutboundEvent) -> RelayAction {
    RelayAction::Deliver { to: to.clone(), event }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use super::*;
    use crate::storage::MemoryStorage;

    #[derive(Clone, Default)]
    struct TestEnv {
        clock: Arc<AtomicU64>,
    }

    impl TestEnv {
        fn advance(&self, millis: u64) {
            self.clock.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Environment for TestEnv {
        fn now(&self) -> Timestamp {
            Timestamp::from_millis(1_000 + self.clock.load(Ordering::SeqCst))
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(7);
        }
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn group(id: &str) -> GroupId {
        GroupId::new(id).unwrap()
    }

    fn mid(id: &str) -> MessageId {
        MessageId::new(id).unwrap()
    }

    fn driver() -> RelayDriver<TestEnv, MemoryStorage> {
        RelayDriver::new(TestEnv::default(), MemoryStorage::new(), RelayConfig::default())
    }

    fn direct(id: &str, from: &str, to: &str, at: u64) -> Message {
        Message::direct(mid(id), user(from), user(to), "hello", Timestamp::from_millis(at))
    }

    fn delivered_to<'a>(actions: &'a [RelayAction], who: &UserId) -> Vec<&'a OutboundEvent> {
        actions
            .iter()
            .filter_map(|action| match action {
                RelayAction::Deliver { to, event } if to == who => Some(event),
                _ => None,
            })
            .collect()
    }

    fn rejected(actions: &[RelayAction]) -> bool {
        actions.iter().any(|action| {
            matches!(action, RelayAction::Deliver { event: OutboundEvent::Rejected { .. }, .. })
        })
    }

    fn create_team(driver: &mut RelayDriver<TestEnv, MemoryStorage>) {
        let actions = driver.process_event(RelayEvent::GroupCreated {
            group_id: group("team"),
            owner: user("alice"),
            members: vec![user("bob"), user("carol")],
        });
        assert!(!rejected(&actions));
    }

    #[test]
    fn submit_acks_sender_and_fans_out() {
        let mut driver = driver();

        let actions = driver
            .process_event(RelayEvent::MessageSubmitted { message: direct("m1", "alice", "bob", 1) });

        assert!(matches!(
            &actions[0],
            RelayAction::PersistMessage { message } if message.status == DeliveryStatus::Sent
        ));
        assert!(matches!(delivered_to(&actions, &user("alice"))[..], [OutboundEvent::Ack { .. }]));
        assert!(matches!(
            delivered_to(&actions, &user("bob"))[..],
            [OutboundEvent::NewMessage { .. }, OutboundEvent::UnreadChanged { unread_count: 1, .. }]
        ));
        assert_eq!(driver.status(&mid("m1")), Some(DeliveryStatus::Sent));
    }

    #[test]
    fn client_supplied_status_is_ignored() {
        let mut driver = driver();
        let mut message = direct("m1", "alice", "bob", 1);
        message.status = DeliveryStatus::Seen;

        driver.process_event(RelayEvent::MessageSubmitted { message });

        assert_eq!(driver.status(&mid("m1")), Some(DeliveryStatus::Sent));
        assert_eq!(driver.message(&mid("m1")).unwrap().status, DeliveryStatus::Sent);
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let mut driver = driver();
        driver.process_event(RelayEvent::MessageSubmitted { message: direct("m1", "alice", "bob", 1) });

        let actions = driver
            .process_event(RelayEvent::MessageSubmitted { message: direct("m1", "alice", "bob", 1) });

        assert!(matches!(
            delivered_to(&actions, &user("alice"))[..],
            [OutboundEvent::Rejected { message_id: Some(_), .. }]
        ));
        assert!(matches!(actions.last(), Some(RelayAction::Log { level: LogLevel::Warn, .. })));
    }

    #[test]
    fn echo_to_sender_delivers_own_message() {
        let config = RelayConfig { echo_to_sender: true, ..RelayConfig::default() };
        let mut driver = RelayDriver::new(TestEnv::default(), MemoryStorage::new(), config);

        let actions = driver
            .process_event(RelayEvent::MessageSubmitted { message: direct("m1", "alice", "bob", 1) });

        assert!(matches!(
            delivered_to(&actions, &user("alice"))[..],
            [OutboundEvent::Ack { .. }, OutboundEvent::NewMessage { .. }]
        ));
    }

    #[test]
    fn unread_deltas_can_be_disabled() {
        let config = RelayConfig { emit_unread_deltas: false, ..RelayConfig::default() };
        let mut driver = RelayDriver::new(TestEnv::default(), MemoryStorage::new(), config);

        let actions = driver
            .process_event(RelayEvent::MessageSubmitted { message: direct("m1", "alice", "bob", 1) });

        assert!(matches!(delivered_to(&actions, &user("bob"))[..], [OutboundEvent::NewMessage { .. }]));
    }

    #[test]
    fn group_submit_creates_receipts_for_members_only() {
        let mut driver = driver();
        create_team(&mut driver);

        let message = Message::group(mid("g1"), user("alice"), group("team"), "hi", Timestamp::from_millis(1));
        let actions = driver.process_event(RelayEvent::MessageSubmitted { message });

        let receipts = actions
            .iter()
            .filter(|action| matches!(action, RelayAction::PersistReceipt { .. }))
            .count();
        assert_eq!(receipts, 2);
        assert!(driver.delivery().receipt(&mid("g1"), &user("alice")).is_none());
        assert!(delivered_to(&actions, &user("carol"))
            .iter()
            .any(|event| matches!(event, OutboundEvent::NewMessage { .. })));
    }

    #[test]
    fn non_member_cannot_post_to_group() {
        let mut driver = driver();
        create_team(&mut driver);

        let message = Message::group(mid("g1"), user("eve"), group("team"), "hi", Timestamp::from_millis(1));
        let actions = driver.process_event(RelayEvent::MessageSubmitted { message });

        assert!(rejected(&actions));
        assert!(driver.message(&mid("g1")).is_none());
    }

    #[test]
    fn member_report_moves_receipt_and_aggregate() {
        let mut driver = driver();
        create_team(&mut driver);
        let message = Message::group(mid("g1"), user("alice"), group("team"), "hi", Timestamp::from_millis(1));
        driver.process_event(RelayEvent::MessageSubmitted { message });

        let report = |who: &str, status| RelayEvent::StatusReported {
            message_id: mid("g1"),
            acting_user_id: Some(user(who)),
            status,
            at: Timestamp::from_millis(5),
        };

        let actions = driver.process_event(report("bob", DeliveryStatus::Delivered));
        assert!(matches!(actions[0], RelayAction::PersistReceipt { .. }));
        assert!(delivered_to(&actions, &user("alice"))
            .iter()
            .all(|event| matches!(event, OutboundEvent::Status(_))));

        let actions = driver.process_event(report("carol", DeliveryStatus::Delivered));
        assert!(delivered_to(&actions, &user("alice")).iter().any(|event| matches!(
            event,
            OutboundEvent::AggregateStatus { status: DeliveryStatus::Delivered, .. }
        )));

        // Stale
        let actions = driver.process_event(report("carol", DeliveryStatus::Delivered));
        assert!(matches!(actions[..], [RelayAction::Log { level: LogLevel::Debug, .. }]));
    }

    #[test]
    fn mark_seen_rejects_message_from_another_chat() {
        let mut driver = driver();
        driver.process_event(RelayEvent::MessageSubmitted { message: direct("m1", "alice", "bob", 1) });

        let actions = driver.process_event(RelayEvent::MarkSeen {
            user_id: user("bob"),
            chat_id: ChatId::direct(&user("bob"), &user("carol")),
            message_id: mid("m1"),
            at: Timestamp::from_millis(2),
        });

        assert!(rejected(&actions));
        assert!(driver.read_state().is_empty());
    }

    #[test]
    fn chat_opened_persists_row_and_reports_unread() {
        let mut driver = driver();
        driver.process_event(RelayEvent::MessageSubmitted { message: direct("m1", "alice", "bob", 1) });
        driver.process_event(RelayEvent::MessageSubmitted { message: direct("m2", "alice", "bob", 2) });

        let actions = driver.process_event(RelayEvent::ChatOpened {
            user_id: user("bob"),
            chat_type: ChatType::Direct,
            target_id: "alice".to_string(),
        });

        assert!(matches!(actions[0], RelayAction::PersistReadState { .. }));
        assert!(matches!(
            delivered_to(&actions, &user("bob"))[..],
            [OutboundEvent::UnreadChanged { unread_count: 2, .. }]
        ));
    }

    #[test]
    fn rotation_bumps_version_and_notifies_members() {
        let mut driver = driver();
        create_team(&mut driver);

        let actions = driver.process_event(RelayEvent::RotateGroupKey {
            group_id: group("team"),
            requested_by: user("alice"),
        });

        assert_eq!(driver.directory().get(&group("team")).unwrap().key_version, 2);
        for member in ["alice", "bob", "carol"] {
            assert!(matches!(
                delivered_to(&actions, &user(member))[..],
                [OutboundEvent::KeyRotated { version: 2, .. }]
            ));
        }
    }

    #[test]
    fn admin_can_rotate_after_joining() {
        let mut driver = driver();
        create_team(&mut driver);
        driver.process_event(RelayEvent::MemberJoined {
            group_id: group("team"),
            user_id: user("dan"),
            role: Role::Admin,
        });

        let actions = driver.process_event(RelayEvent::RotateGroupKey {
            group_id: group("team"),
            requested_by: user("dan"),
        });

        assert!(!rejected(&actions));
        assert_eq!(driver.directory().get(&group("team")).unwrap().key_version, 2);
    }

    #[test]
    fn edit_after_delete_is_rejected() {
        let mut driver = driver();
        driver.process_event(RelayEvent::MessageSubmitted { message: direct("m1", "alice", "bob", 1) });
        driver.env.advance(10);
        driver.process_event(RelayEvent::MessageDeleted {
            message_id: mid("m1"),
            user_id: user("alice"),
            scope: DeleteScope::Everyone,
        });

        let actions = driver.process_event(RelayEvent::MessageEdited {
            message_id: mid("m1"),
            user_id: user("alice"),
            text: "again".to_string(),
            at: Timestamp::from_millis(20),
        });

        assert!(rejected(&actions));
        assert_eq!(driver.message(&mid("m1")).unwrap().text, "hello");
    }

    #[test]
    fn recover_rebuilds_state_from_storage() {
        let mut driver = driver();
        create_team(&mut driver);
        let mut all = Vec::new();
        let message = Message::group(mid("g1"), user("alice"), group("team"), "hi", Timestamp::from_millis(1));
        all.extend(driver.process_event(RelayEvent::MessageSubmitted { message }));
        all.extend(driver.process_event(RelayEvent::StatusReported {
            message_id: mid("g1"),
            acting_user_id: Some(user("bob")),
            status: DeliveryStatus::Seen,
            at: Timestamp::from_millis(3),
        }));
        crate::execute_storage_actions(driver.storage(), &all).unwrap();
        // Group creation actions were not executed above
        driver.storage().store_group(driver.directory().get(&group("team")).unwrap()).unwrap();

        let mut recovered =
            RelayDriver::new(TestEnv::default(), driver.storage().clone(), RelayConfig::default());
        let report = recovered.recover().unwrap();

        assert_eq!(report, RecoveryReport { groups: 1, messages: 1, receipts: 2, read_states: 0 });
        assert_eq!(recovered.status(&mid("g1")), driver.status(&mid("g1")));
        assert_eq!(
            recovered.delivery().receipt(&mid("g1"), &user("bob")).unwrap().status,
            DeliveryStatus::Seen
        );
        assert!(recovered.directory().require_member(&group("team"), &user("carol")).is_ok());
    }

    #[test]
    fn recover_recomputes_stale_unread_cache() {
        let mut driver = driver();
        let mut all = Vec::new();
        all.extend(driver.process_event(RelayEvent::ChatOpened {
            user_id: user("bob"),
            chat_type: ChatType::Direct,
            target_id: "alice".to_string(),
        }));
        all.extend(driver.process_event(RelayEvent::MessageSubmitted {
            message: direct("m1", "alice", "bob", 1),
        }));
        crate::execute_storage_actions(driver.storage(), &all).unwrap();

        // Row persisted before the message landed
        let chat = ChatId::direct(&user("alice"), &user("bob"));
        let mut stale = driver.read_state().get(&user("bob"), &chat).unwrap().clone();
        stale.unread_count = 0;
        driver.storage().store_read_state(&stale).unwrap();

        let mut recovered =
            RelayDriver::new(TestEnv::default(), driver.storage().clone(), RelayConfig::default());
        recovered.recover().unwrap();

        assert_eq!(recovered.read_state().get(&user("bob"), &chat).unwrap().unread_count, 1);
    }

    #[test]
    fn sender_clock_skew_is_clamped_to_relay_time() {
        let mut driver = driver();
        driver.process_event(RelayEvent::MessageSubmitted {
            message: direct("m1", "alice", "bob", 50_000),
        });
        assert_eq!(driver.message(&mid("m1")).unwrap().created_at, Timestamp::from_millis(1_000));

        let chat = ChatId::direct(&user("alice"), &user("bob"));
        let actions = driver.process_event(RelayEvent::MarkSeen {
            user_id: user("bob"),
            chat_id: chat.clone(),
            message_id: mid("m1"),
            at: Timestamp::from_millis(2_000),
        });

        assert!(!rejected(&actions));
        assert_eq!(driver.status(&mid("m1")), Some(DeliveryStatus::Seen));
        assert_eq!(driver.unread_count(&user("bob"), &chat), 0);
    }

    #[test]
    fn lagging_reader_clock_still_clears_the_seen_message() {
        let mut driver = driver();
        driver.env.advance(5_000);
        driver.process_event(RelayEvent::MessageSubmitted {
            message: direct("m1", "alice", "bob", 6_000),
        });

        let chat = ChatId::direct(&user("alice"), &user("bob"));
        driver.process_event(RelayEvent::MarkSeen {
            user_id: user("bob"),
            chat_id: chat.clone(),
            message_id: mid("m1"),
            at: Timestamp::from_millis(10),
        });

        assert_eq!(
            driver.read_state().watermark(&user("bob"), &chat),
            Some(Timestamp::from_millis(6_000))
        );
        assert_eq!(driver.status(&mid("m1")), Some(DeliveryStatus::Seen));
        assert_eq!(driver.unread_count(&user("bob"), &chat), 0);
    }

    #[test]
    fn each_participant_hides_independently() {
        let mut driver = driver();
        driver.process_event(RelayEvent::MessageSubmitted { message: direct("m1", "alice", "bob", 1) });

        let hide = |who: &str| RelayEvent::MessageDeleted {
            message_id: mid("m1"),
            user_id: user(who),
            scope: DeleteScope::Me,
        };
        driver.process_event(hide("bob"));
        let actions = driver.process_event(hide("alice"));

        assert!(matches!(actions[0], RelayAction::PersistMessage { .. }));
        assert!(matches!(
            delivered_to(&actions, &user("alice"))[..],
            [OutboundEvent::MessageUpdated { .. }]
        ));
        let record = driver.message(&mid("m1")).unwrap();
        assert!(!record.is_visible_to(&user("alice")));
        assert!(!record.is_visible_to(&user("bob")));

        let again = driver.process_event(hide("alice"));
        assert!(matches!(again[..], [RelayAction::Log { level: LogLevel::Debug, .. }]));
    }

    #[test]
    fn events_parse_from_camel_case_json() {
        let event: RelayEvent = serde_json::from_str(
            r#"{"type":"markSeen","userId":"bob","chatId":"direct:alice:bob","messageId":"m1","at":5}"#,
        )
        .unwrap();

        assert_eq!(event, RelayEvent::MarkSeen {
            user_id: user("bob"),
            chat_id: ChatId::direct(&user("alice"), &user("bob")),
            message_id: mid("m1"),
            at: Timestamp::from_millis(5),
        });
        assert_eq!(event.actor(), Some(&user("bob")));
    }

    #[test]
    fn actions_serialize_with_tags() {
        let action = deliver(&user("bob"), OutboundEvent::UnreadChanged {
            chat_id: ChatId::direct(&user("alice"), &user("bob")),
            unread_count: 3,
        });

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "deliver");
        assert_eq!(json["to"], "bob");
        assert_eq!(json["event"]["type"], "unreadChanged");
        assert_eq!(json["event"]["unreadCount"], 3);
    }
}
