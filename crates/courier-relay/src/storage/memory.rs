#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use courier_core::{ChatId, ChatReadState, GroupId, Message, MessageId, Receipt, UserId};

use super::{Storage, StorageError};
use crate::directory::GroupRecord;

/// In-memory storage implementation for testing and simulation
///
/// Uses `HashMap` for lookups plus a Vec recording first-store order for
/// messages. All state is wrapped in Arc<Mutex<>> so clones share the same
/// maps. A poisoned lock surfaces as [`StorageError::Poisoned`] from trait
/// methods; the counting helpers read through poison.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// Message records by id
    messages: HashMap<MessageId, Message>,

    /// Message ids in first-store order
    order: Vec<MessageId>,

    /// Group receipts per message, in first-store order per member
    receipts: HashMap<MessageId, Vec<Receipt>>,

    /// Read-state rows keyed by (user, chat)
    read_states: HashMap<(UserId, ChatId), ChatReadState>,

    /// Group directory records
    groups: HashMap<GroupId, GroupRecord>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStorageInner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }

    fn peek(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.peek().messages.len()
    }

    /// Total number of receipt rows across all messages.
    pub fn receipt_count(&self) -> usize {
        self.peek().receipts.values().map(Vec::len).sum()
    }

    /// Number of stored read-state rows.
    pub fn read_state_count(&self) -> usize {
        self.peek().read_states.len()
    }

    /// Number of stored groups.
    pub fn group_count(&self) -> usize {
        self.peek().groups.len()
    }
}

impl Storage for MemoryStorage {
    fn store_message(&self, message: &Message) -> Result<(), StorageError> {
        let mut inner = self.lock()?;

        if inner.messages.insert(message.id.clone(), message.clone()).is_none() {
            inner.order.push(message.id.clone());
        }

        debug_assert_eq!(inner.order.len(), inner.messages.len());
        Ok(())
    }

    fn load_message(&self, message_id: &MessageId) -> Result<Option<Message>, StorageError> {
        Ok(self.lock()?.messages.get(message_id).cloned())
    }

    fn list_messages(&self) -> Result<Vec<Message>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.order.iter().filter_map(|id| inner.messages.get(id).cloned()).collect())
    }

    fn store_receipt(
        &self,
        message_id: &MessageId,
        receipt: &Receipt,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let rows = inner.receipts.entry(message_id.clone()).or_default();

        match rows.iter_mut().find(|row| row.user_id == receipt.user_id) {
            Some(row) => *row = receipt.clone(),
            None => rows.push(receipt.clone()),
        }
        Ok(())
    }

    fn load_receipts(&self, message_id: &MessageId) -> Result<Vec<Receipt>, StorageError> {
        Ok(self.lock()?.receipts.get(message_id).cloned().unwrap_or_default())
    }

    fn store_read_state(&self, state: &ChatReadState) -> Result<(), StorageError> {
        self.lock()?
            .read_states
            .insert((state.user_id.clone(), state.chat_id.clone()), state.clone());
        Ok(())
    }

    fn load_read_state(
        &self,
        user_id: &UserId,
        chat_id: &ChatId,
    ) -> Result<Option<ChatReadState>, StorageError> {
        Ok(self.lock()?.read_states.get(&(user_id.clone(), chat_id.clone())).cloned())
    }

    fn list_read_states(&self) -> Result<Vec<ChatReadState>, StorageError> {
        Ok(self.lock()?.read_states.values().cloned().collect())
    }

    fn store_group(&self, group: &GroupRecord) -> Result<(), StorageError> {
        self.lock()?.groups.insert(group.group_id.clone(), group.clone());
        Ok(())
    }

    fn list_groups(&self) -> Result<Vec<GroupRecord>, StorageError> {
        Ok(self.lock()?.groups.values().cloned().collect())
    }
}
