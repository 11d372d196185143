//! Deterministic environment for simulation.
//!
//! Virtual clock plus a seeded ChaCha RNG. Two `SimEnv`s with the same seed
//! produce the same message ids, nonces and envelopes, so every scenario is
//! reproducible from its seed.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use courier_core::{Environment, Timestamp};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Virtual clock start: 2023-11-14T22:13:20Z.
pub const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Seeded environment with a manually advanced clock.
///
/// Clones share the clock and the RNG stream.
#[derive(Clone)]
pub struct SimEnv {
    seed: u64,
    clock: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Environment seeded with `seed`, clock at [`SIM_EPOCH_MILLIS`].
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            clock: Arc::new(AtomicU64::new(SIM_EPOCH_MILLIS)),
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
        }
    }

    /// Seed this environment was built from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.clock.fetch_add(millis, Ordering::SeqCst);
    }

    /// Move the clock to `at` if that is later than now; never rewinds.
    pub fn advance_to(&self, at: Timestamp) {
        self.clock.fetch_max(at.as_millis(), Ordering::SeqCst);
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Environment for SimEnv {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.clock.load(Ordering::SeqCst))
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("seed", &self.seed).field("now", &self.now()).finish()
    }
}
