//! Simulated world: one relay, many clients, in-process routing.
//!
//! Every event goes through the real [`RelayDriver`]; its persist actions hit
//! the configured storage and its `Deliver` actions land in the addressed
//! [`SimClient`]. Deliveries to users without a client are dropped, like a
//! push to an offline device.

use std::collections::BTreeMap;

use courier_core::{
    ChatId, ChatType, CoreError, DeleteScope, DeliveryStatus, Environment, GroupId, Message,
    MessageId, Timestamp, UserId,
};
use courier_relay::{
    MemoryStorage, RelayAction, RelayConfig, RelayDriver, RelayEvent, Storage, StorageError,
    emit_log, execute_storage_actions,
};

use crate::{client::SimClient, sim_env::SimEnv};

/// Relay plus clients sharing one deterministic environment.
pub struct SimWorld<S: Storage = MemoryStorage> {
    env: SimEnv,
    relay: RelayDriver<SimEnv, S>,
    clients: BTreeMap<UserId, SimClient>,
    storage_failures: Vec<StorageError>,
}

impl SimWorld<MemoryStorage> {
    /// World with in-memory storage and default relay configuration.
    pub fn new(seed: u64) -> Self {
        Self::with_storage(seed, MemoryStorage::new(), RelayConfig::default())
    }
}

impl<S: Storage> SimWorld<S> {
    /// World over `storage` with `config`.
    pub fn with_storage(seed: u64, storage: S, config: RelayConfig) -> Self {
        let env = SimEnv::with_seed(seed);
        let relay = RelayDriver::new(env.clone(), storage, config);
        Self { env, relay, clients: BTreeMap::new(), storage_failures: Vec::new() }
    }

    /// Shared environment (advance the clock through it).
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// The relay.
    pub fn relay(&self) -> &RelayDriver<SimEnv, S> {
        &self.relay
    }

    /// Storage failures seen while executing persist actions.
    pub fn storage_failures(&self) -> &[StorageError] {
        &self.storage_failures
    }

    /// Register a client for `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid user id.
    #[allow(clippy::expect_used)]
    pub fn add_client(&mut self, name: &str) -> UserId {
        let user_id = UserId::new(name).expect("simulation user names are valid ids");
        self.clients
            .entry(user_id.clone())
            .or_insert_with(|| SimClient::new(user_id.clone(), self.env.clone()));
        user_id
    }

    /// Client for `user_id`.
    ///
    /// # Panics
    ///
    /// Panics if no such client was added.
    #[allow(clippy::expect_used)]
    pub fn client(&self, user_id: &UserId) -> &SimClient {
        self.clients.get(user_id).expect("client registered with add_client")
    }

    #[allow(clippy::expect_used)]
    fn client_mut(&mut self, user_id: &UserId) -> &mut SimClient {
        self.clients.get_mut(user_id).expect("client registered with add_client")
    }

    /// Run one event through the relay, execute its actions and return them.
    pub fn dispatch(&mut self, event: RelayEvent) -> Vec<RelayAction> {
        let actions = self.relay.process_event(event);

        if let Err(e) = execute_storage_actions(self.relay.storage(), &actions) {
            self.storage_failures.push(e);
        }

        for action in &actions {
            match action {
                RelayAction::Deliver { to, event } => {
                    if let Some(client) = self.clients.get_mut(to) {
                        client.receive(event.clone());
                    }
                },
                RelayAction::Log { .. } => emit_log(action),
                _ => {},
            }
        }
        actions
    }

    /// Create a group owned by `owner` with `members`.
    pub fn create_group(&mut self, group: &str, owner: &UserId, members: &[UserId]) -> GroupId {
        let group_id = group_id(group);
        self.dispatch(RelayEvent::GroupCreated {
            group_id: group_id.clone(),
            owner: owner.clone(),
            members: members.to_vec(),
        });
        group_id
    }

    /// `from` seals and submits a direct message to `to`.
    ///
    /// # Errors
    ///
    /// - Sealing errors from the client
    pub fn send_direct(
        &mut self,
        from: &UserId,
        to: &UserId,
        text: &str,
    ) -> Result<MessageId, CoreError> {
        let message = self.client_mut(from).compose_direct(to, text, None)?;
        Ok(self.submit(message))
    }

    /// `from` seals and submits a message to `group_id`.
    ///
    /// # Errors
    ///
    /// - `InvalidGroup` if `from` never joined the group
    pub fn send_group(
        &mut self,
        from: &UserId,
        group_id: &GroupId,
        text: &str,
    ) -> Result<MessageId, CoreError> {
        let message = self.client_mut(from).compose_group(group_id, text)?;
        Ok(self.submit(message))
    }

    /// Submit an already composed record.
    pub fn submit(&mut self, message: Message) -> MessageId {
        let message_id = message.id.clone();
        self.dispatch(RelayEvent::MessageSubmitted { message });
        message_id
    }

    /// `user_id` reports `status` for `message_id` at the current time.
    pub fn report(&mut self, user_id: &UserId, message_id: &MessageId, status: DeliveryStatus) {
        let at = self.env.now();
        self.dispatch(RelayEvent::StatusReported {
            message_id: message_id.clone(),
            acting_user_id: Some(user_id.clone()),
            status,
            at,
        });
    }

    /// Every client that received `message_id` reports `Delivered`.
    pub fn deliver_all(&mut self, message_id: &MessageId) {
        let receivers: Vec<UserId> = self
            .clients
            .values()
            .filter(|client| client.received().contains(message_id))
            .map(|client| client.user_id().clone())
            .collect();
        for user_id in receivers {
            self.report(&user_id, message_id, DeliveryStatus::Delivered);
        }
    }

    /// `user_id` opens a chat.
    pub fn open_chat(&mut self, user_id: &UserId, chat_type: ChatType, target_id: &str) {
        self.dispatch(RelayEvent::ChatOpened {
            user_id: user_id.clone(),
            chat_type,
            target_id: target_id.to_string(),
        });
    }

    /// `user_id` marks `chat_id` seen up to `message_id` at `at`.
    pub fn mark_seen(
        &mut self,
        user_id: &UserId,
        chat_id: &ChatId,
        message_id: &MessageId,
        at: Timestamp,
    ) -> Vec<RelayAction> {
        self.dispatch(RelayEvent::MarkSeen {
            user_id: user_id.clone(),
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
            at,
        })
    }

    /// `requested_by` asks the relay to rotate `group_id`'s key.
    pub fn rotate(&mut self, group_id: &GroupId, requested_by: &UserId) -> Vec<RelayAction> {
        self.dispatch(RelayEvent::RotateGroupKey {
            group_id: group_id.clone(),
            requested_by: requested_by.clone(),
        })
    }

    /// `user_id` deletes `message_id` with `scope`.
    pub fn delete(&mut self, user_id: &UserId, message_id: &MessageId, scope: DeleteScope) {
        self.dispatch(RelayEvent::MessageDeleted {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            scope,
        });
    }

    /// The author re-seals and submits a new body for `message_id`.
    ///
    /// # Errors
    ///
    /// - Sealing errors from the client
    pub fn edit(
        &mut self,
        user_id: &UserId,
        message_id: &MessageId,
        text: &str,
    ) -> Result<(), CoreError> {
        let sealed = self.client(user_id).seal_edit(message_id, text)?;
        let at = self.env.now();
        self.dispatch(RelayEvent::MessageEdited {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            text: sealed,
            at,
        });
        Ok(())
    }

    /// `user_id` sets or clears a reaction.
    pub fn react(&mut self, user_id: &UserId, message_id: &MessageId, emoji: Option<&str>) {
        self.dispatch(RelayEvent::ReactionSet {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            emoji: emoji.map(str::to_string),
        });
    }
}

#[allow(clippy::expect_used)]
fn group_id(name: &str) -> GroupId {
    GroupId::new(name).expect("simulation group names are valid ids")
}
