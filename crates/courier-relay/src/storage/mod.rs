//! Storage abstraction for the Courier relay
//!
//! Trait-based abstraction for persisting message records, group receipts,
//! read state and the group directory. The trait is synchronous (no async) so
//! the driver and its tests stay free of a runtime.
//!
//! The relay only ever stores ciphertext: message bodies are sealed by clients
//! before submission.

mod chaotic;
mod error;
mod memory;

pub use chaotic::ChaoticStorage;
use courier_core::{ChatId, ChatReadState, Message, MessageId, Receipt, UserId};
pub use error::StorageError;
pub use memory::MemoryStorage;

use crate::directory::GroupRecord;

/// Storage abstraction for relay state
///
/// Must be Clone (can be passed to the driver and the action executor), Send +
/// Sync (thread-safe), and synchronous (no async methods). Implementations
/// typically share internal state via Arc, so clones access the same underlying
/// storage.
///
/// Every `store_*` is an upsert keyed by the record's identity, so replaying
/// the same persist action twice is harmless.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Store or overwrite a message record.
    ///
    /// # Invariants
    ///
    /// - Post: `list_messages` keeps the position of the first store
    fn store_message(&self, message: &Message) -> Result<(), StorageError>;

    /// Load a message record. `None` if never stored.
    fn load_message(&self, message_id: &MessageId) -> Result<Option<Message>, StorageError>;

    /// All message records, in first-store order.
    fn list_messages(&self) -> Result<Vec<Message>, StorageError>;

    /// Store or overwrite one member's receipt for a group message.
    ///
    /// # Invariants
    ///
    /// - Post: `load_receipts` keeps the position of the member's first store
    fn store_receipt(&self, message_id: &MessageId, receipt: &Receipt)
    -> Result<(), StorageError>;

    /// Receipts for a group message, in first-store order.
    ///
    /// Returns an empty list for unknown messages.
    fn load_receipts(&self, message_id: &MessageId) -> Result<Vec<Receipt>, StorageError>;

    /// Store or overwrite a read-state row.
    fn store_read_state(&self, state: &ChatReadState) -> Result<(), StorageError>;

    /// Load a read-state row. `None` if never stored.
    fn load_read_state(
        &self,
        user_id: &UserId,
        chat_id: &ChatId,
    ) -> Result<Option<ChatReadState>, StorageError>;

    /// All read-state rows. Order is not guaranteed.
    fn list_read_states(&self) -> Result<Vec<ChatReadState>, StorageError>;

    /// Store or overwrite a group's directory record.
    fn store_group(&self, group: &GroupRecord) -> Result<(), StorageError>;

    /// All group records. Order is not guaranteed.
    fn list_groups(&self) -> Result<Vec<GroupRecord>, StorageError>;
}
