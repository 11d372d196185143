//! Simulated client.
//!
//! Owns its own [`KeyManager`], composes sealed messages and applies whatever
//! the relay delivers to it. Everything a real client would render (opened
//! text, status ticks, unread badges) is observable for assertions.

use std::collections::HashMap;

use courier_core::{
    ChatId, CoreError, DeliveryStatus, GroupId, KeyManager, MediaType, Message, MessageId,
    OpenedMessage, UserId, compose_direct, compose_group, open, seal_edit,
};
use courier_relay::OutboundEvent;

use crate::sim_env::SimEnv;

/// One simulated user.
#[derive(Debug)]
pub struct SimClient {
    user_id: UserId,
    env: SimEnv,
    keys: KeyManager,
    /// Messages received or sent, by id
    messages: HashMap<MessageId, Message>,
    /// Status of own messages as last reported by the relay
    statuses: HashMap<MessageId, DeliveryStatus>,
    /// Latest unread count per chat
    unread: HashMap<ChatId, u32>,
    /// Every event delivered, in order
    inbox: Vec<OutboundEvent>,
    /// Reasons of refused requests
    rejections: Vec<String>,
}

impl SimClient {
    /// New client for `user_id` drawing randomness from `env`.
    pub fn new(user_id: UserId, env: SimEnv) -> Self {
        Self {
            user_id,
            env,
            keys: KeyManager::default(),
            messages: HashMap::new(),
            statuses: HashMap::new(),
            unread: HashMap::new(),
            inbox: Vec::new(),
            rejections: Vec::new(),
        }
    }

    /// This client's user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// This client's key manager.
    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Seal a direct message to `to` and remember it as sent.
    ///
    /// # Errors
    ///
    /// - `InvalidRecord` if sealing fails
    pub fn compose_direct(
        &mut self,
        to: &UserId,
        text: &str,
        media: Option<(&str, MediaType)>,
    ) -> Result<Message, CoreError> {
        let message = compose_direct(&self.user_id, to, text, media, &self.keys, &self.env)?;
        self.track_outgoing(&message);
        Ok(message)
    }

    /// Seal a group message under the current group key.
    ///
    /// # Errors
    ///
    /// - `InvalidGroup` if this client never joined the group
    pub fn compose_group(&mut self, group_id: &GroupId, text: &str) -> Result<Message, CoreError> {
        let message = compose_group(&self.user_id, group_id, text, None, &self.keys, &self.env)?;
        self.track_outgoing(&message);
        Ok(message)
    }

    /// Seal a replacement body for one of this client's messages.
    ///
    /// # Errors
    ///
    /// - `UnknownMessage` if the client has no such message
    /// - `InvalidGroup` if the message's key version is unknown
    pub fn seal_edit(&self, message_id: &MessageId, text: &str) -> Result<String, CoreError> {
        let message = self.message(message_id)?;
        seal_edit(message, text, &self.keys, &self.env)
    }

    /// Decrypt a message this client holds.
    ///
    /// # Errors
    ///
    /// - `UnknownMessage` if the client has no such message
    /// - `DecryptionFailed`/`InvalidGroup` as for [`courier_core::open`]
    pub fn open(&self, message_id: &MessageId) -> Result<OpenedMessage, CoreError> {
        open(self.message(message_id)?, &self.keys)
    }

    /// Stored record for `message_id`.
    ///
    /// # Errors
    ///
    /// - `UnknownMessage` if the client has no such message
    pub fn message(&self, message_id: &MessageId) -> Result<&Message, CoreError> {
        self.messages.get(message_id).ok_or_else(|| CoreError::UnknownMessage(message_id.clone()))
    }

    /// Last status the relay reported for one of this client's messages.
    pub fn status(&self, message_id: &MessageId) -> Option<DeliveryStatus> {
        self.statuses.get(message_id).copied()
    }

    /// Last unread count the relay reported for `chat_id`.
    pub fn unread(&self, chat_id: &ChatId) -> Option<u32> {
        self.unread.get(chat_id).copied()
    }

    /// Every event delivered so far.
    pub fn inbox(&self) -> &[OutboundEvent] {
        &self.inbox
    }

    /// Reasons of refused requests so far.
    pub fn rejections(&self) -> &[String] {
        &self.rejections
    }

    /// Ids of messages received from others, in arrival order.
    pub fn received(&self) -> Vec<MessageId> {
        self.inbox
            .iter()
            .filter_map(|event| match event {
                OutboundEvent::NewMessage { message } if message.sender_id != self.user_id => {
                    Some(message.id.clone())
                },
                _ => None,
            })
            .collect()
    }

    /// Apply an event delivered by the relay.
    pub fn receive(&mut self, event: OutboundEvent) {
        match &event {
            OutboundEvent::NewMessage { message } | OutboundEvent::MessageUpdated { message } => {
                self.messages.insert(message.id.clone(), message.clone());
            },
            OutboundEvent::Ack { message_id, .. } => {
                self.raise_status(message_id, DeliveryStatus::Sent);
            },
            // Member rows of a group message don't move the author's tick;
            // the aggregate does.
            OutboundEvent::Status(notification) => {
                if notification.acting_user_id.is_none() || self.is_direct(&notification.message_id)
                {
                    self.raise_status(&notification.message_id, notification.status);
                }
            },
            OutboundEvent::AggregateStatus { message_id, status } => {
                self.statuses.insert(message_id.clone(), *status);
            },
            OutboundEvent::KeyRotated { group_id, version }
            | OutboundEvent::GroupJoined { group_id, key_version: version } => {
                if let Err(e) = self.keys.observe_group_version(group_id, *version) {
                    tracing::warn!(user_id = %self.user_id, "ignoring key version: {}", e);
                }
            },
            OutboundEvent::UnreadChanged { chat_id, unread_count } => {
                self.unread.insert(chat_id.clone(), *unread_count);
            },
            OutboundEvent::Rejected { reason, .. } => {
                self.rejections.push(reason.clone());
            },
        }
        self.inbox.push(event);
    }

    fn track_outgoing(&mut self, message: &Message) {
        self.statuses.insert(message.id.clone(), message.status);
        self.messages.insert(message.id.clone(), message.clone());
    }

    fn is_direct(&self, message_id: &MessageId) -> bool {
        self.messages.get(message_id).is_some_and(|message| message.group_id.is_none())
    }

    fn raise_status(&mut self, message_id: &MessageId, status: DeliveryStatus) {
        let entry = self.statuses.entry(message_id.clone()).or_default();
        if entry.accepts(status) {
            *entry = status;
        }
    }
}
