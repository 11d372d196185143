//! Storage error types.
//!
//! Defines errors that can occur during storage operations:
//! - `Io`: Underlying storage system errors
//! - `Poisoned`: A writer panicked while holding the store lock

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error (file system, database, injected fault)
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal lock poisoned by a panicking writer
    ///
    /// The in-memory maps may be half-updated. Not retryable; rebuild the
    /// store.
    #[error("storage lock poisoned")]
    Poisoned,
}

impl StorageError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
