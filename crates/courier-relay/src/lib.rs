//! Courier relay.
//!
//! Server-side glue around [`courier_core`]: the relay acknowledges
//! submissions, fans sealed messages out to recipients, keeps group receipts
//! and read state, and authorizes group key rotation. It never holds a key or
//! a plaintext.
//!
//! # Architecture
//!
//! [`RelayDriver`] follows the Sans-IO pattern: each [`RelayEvent`] returns
//! the [`RelayAction`]s to execute. Persist actions go to a [`Storage`]
//! backend through [`execute_storage_actions`]; `Deliver` actions go to
//! whatever transport the runtime has (the replay binary writes them as
//! NDJSON, the simulation harness routes them to in-process clients).
//!
//! # Components
//!
//! - [`RelayDriver`]: action-based orchestrator (pure logic, no I/O)
//! - [`GroupDirectory`]: groups, roles and key versions
//! - [`storage`]: synchronous persistence trait with memory and chaos backends
//! - [`SystemEnv`]: production environment (wall clock, OS RNG)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod directory;
mod driver;
mod error;
pub mod storage;
mod system_env;

pub use directory::{GroupDirectory, GroupRecord, Role};
pub use driver::{
    LogLevel, OutboundEvent, RecoveryReport, RelayAction, RelayConfig, RelayDriver, RelayEvent,
};
pub use error::RelayError;
pub use storage::{ChaoticStorage, MemoryStorage, Storage, StorageError};
pub use system_env::SystemEnv;

/// Apply the persist actions in `actions` to `storage`, in order.
///
/// Other actions are skipped. A failed write is logged and the remaining
/// writes still run; the first failure is returned.
pub fn execute_storage_actions<S: Storage>(
    storage: &S,
    actions: &[RelayAction],
) -> Result<(), StorageError> {
    let mut first_failure = None;

    for action in actions {
        let result = match action {
            RelayAction::PersistMessage { message } => storage.store_message(message),
            RelayAction::PersistReceipt { message_id, receipt } => {
                storage.store_receipt(message_id, receipt)
            },
            RelayAction::PersistReadState { state } => storage.store_read_state(state),
            RelayAction::PersistGroup { group } => storage.store_group(group),
            RelayAction::Deliver { .. } | RelayAction::Log { .. } => continue,
        };

        if let Err(e) = result {
            tracing::error!(error = %e, "failed to persist relay state");
            first_failure.get_or_insert(e);
        }
    }

    first_failure.map_or(Ok(()), Err)
}

/// Forward a `Log` action to `tracing`. Other actions are ignored.
pub fn emit_log(action: &RelayAction) {
    if let RelayAction::Log { level, message, at } = action {
        match level {
            LogLevel::Debug => tracing::debug!(%at, "{message}"),
            LogLevel::Info => tracing::info!(%at, "{message}"),
            LogLevel::Warn => tracing::warn!(%at, "{message}"),
            LogLevel::Error => tracing::error!(%at, "{message}"),
        }
    }
}
