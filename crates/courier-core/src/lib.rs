//! Courier Delivery Core
//!
//! The four state-holding components of secure chat delivery, free of I/O:
//!
//! - [`keys`]: Key Manager. Deterministic direct and group keys, versioned
//!   group rotation, injected cache.
//! - [`cipher`]: Cipher Pipeline. Seals and opens message records.
//! - [`delivery`]: Delivery State Machine. Monotone per-message and
//!   per-member status with a read-time group aggregate.
//! - [`read_state`]: Read-State Tracker. Monotone watermarks and unread
//!   counts.
//!
//! # Architecture
//!
//! ```text
//!   compose ──► KeyManager ──► cipher::seal ──► Message (ciphertext)
//!                                                  │
//!                                     relay        ▼
//!                             ┌──────────────────────────────────┐
//!   StatusEvent ────────────► │ DeliveryStateMachine             │ ──► notifications
//!   markSeen ───────────────► │ ReadStateTracker ──► Seen bridge │ ──► unread deltas
//!                             └──────────────────────────────────┘
//!                                                  │
//!   open ◄── KeyManager ◄── cipher::open ◄─────────┘
//! ```
//!
//! Time and randomness come from an [`Environment`], so the same code runs
//! against the system clock in production and a seeded simulation in tests.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cipher;
pub mod delivery;
pub mod env;
pub mod error;
pub mod ids;
pub mod keys;
pub mod message;
pub mod read_state;
pub mod status;

pub use cipher::{
    DIRECT_KEY_VERSION, OpenedMessage, compose_direct, compose_group, open, seal, seal_direct,
    seal_edit, seal_group,
};
pub use delivery::{
    DeliveryAction, DeliveryStateMachine, ReceiptIndex, StatusEvent, StatusNotification,
};
pub use env::Environment;
pub use error::CoreError;
pub use ids::{
    ChatId, ChatKind, ChatType, GroupId, IdError, MessageId, Timestamp, UserId, chat_id_for,
};
pub use keys::{INITIAL_GROUP_VERSION, KeyCache, KeyManager, KeySlot, MemoryKeyCache};
pub use message::{
    DeleteScope, MediaType, Message, MessageType, MessageWithReceipts, Reaction, Target,
};
pub use read_state::{ChatReadState, MarkSeen, ReadStateTracker, compute_unread};
pub use status::{Advance, DeliveryStatus, Receipt, StatusCell, aggregate_status};
