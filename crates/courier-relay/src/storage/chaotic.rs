//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations to test error handling and
//! recovery. Used for chaos testing to check that the relay keeps its
//! in-memory state consistent when persistence fails underneath it.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use courier_core::{ChatId, ChatReadState, Message, MessageId, Receipt, UserId};

use super::{Storage, StorageError};
use crate::directory::GroupRecord;

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but randomly fails
/// operations based on a configured failure rate. A failed operation never
/// reaches the inner storage. Uses Arc<Mutex<>> for the RNG state, making it
/// Clone and thread-safe.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operations attempted, failed or not
    operation_count: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator; the same seed yields the same failure
/// pattern.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }

    fn should_fail(&mut self, failure_rate: f64) -> bool {
        self.next() < failure_rate
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper with a fixed default seed
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Count the operation and roll for an injected failure.
    fn roll(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        let fail = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_fail(self.failure_rate);
        if fail { Err(StorageError::Io("chaotic failure injection".to_string())) } else { Ok(()) }
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn store_message(&self, message: &Message) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_message(message)
    }

    fn load_message(&self, message_id: &MessageId) -> Result<Option<Message>, StorageError> {
        self.roll()?;
        self.inner.load_message(message_id)
    }

    fn list_messages(&self) -> Result<Vec<Message>, StorageError> {
        self.roll()?;
        self.inner.list_messages()
    }

    fn store_receipt(
        &self,
        message_id: &MessageId,
        receipt: &Receipt,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_receipt(message_id, receipt)
    }

    fn load_receipts(&self, message_id: &MessageId) -> Result<Vec<Receipt>, StorageError> {
        self.roll()?;
        self.inner.load_receipts(message_id)
    }

    fn store_read_state(&self, state: &ChatReadState) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_read_state(state)
    }

    fn load_read_state(
        &self,
        user_id: &UserId,
        chat_id: &ChatId,
    ) -> Result<Option<ChatReadState>, StorageError> {
        self.roll()?;
        self.inner.load_read_state(user_id, chat_id)
    }

    fn list_read_states(&self) -> Result<Vec<ChatReadState>, StorageError> {
        self.roll()?;
        self.inner.list_read_states()
    }

    fn store_group(&self, group: &GroupRecord) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_group(group)
    }

    fn list_groups(&self) -> Result<Vec<GroupRecord>, StorageError> {
        self.roll()?;
        self.inner.list_groups()
    }
}
