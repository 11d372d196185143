//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` is the production implementation of the Environment trait using
//! the real wall clock and cryptographic RNG. Behavior is non-deterministic,
//! but timestamps are security-irrelevant and randomness is security-grade.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use courier_core::{Environment, Timestamp};

/// Production environment using the system clock and cryptographic RNG.
///
/// `now()` is clamped so it never goes backwards even if the wall clock is
/// adjusted; clones share the clamp.
///
/// # Security
///
/// The RNG uses getrandom which provides OS-level cryptographic randomness
/// (e.g., /dev/urandom on Linux, `BCryptGenRandom` on Windows). Suitable for
/// AEAD nonces and message ids.
///
/// # Panics
///
/// Panics if the OS RNG fails. A relay without functioning cryptographic
/// randomness would hand out repeated nonces.
#[derive(Clone, Default)]
pub struct SystemEnv {
    last_millis: Arc<AtomicU64>,
}

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        let previous = self.last_millis.fetch_max(wall, Ordering::SeqCst);
        Timestamp::from_millis(previous.max(wall))
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - relay cannot seal securely");
    }
}
