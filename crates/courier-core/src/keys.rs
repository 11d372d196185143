//! Key Manager: derive-on-miss key lookup with versioned group keys.
//!
//! Keys are never persisted. Every key is a pure function of public
//! identifiers (see [`courier_crypto::derive_direct_key`]), so the cache is
//! only an optimization: a miss re-derives, and two processes that never
//! talked agree on every key.
//!
//! Group versions are the one piece of state. A manager only derives keys
//! for versions it has seen: the version a group was registered at, versions
//! it rotated to itself, and versions announced by someone else's rotation
//! ([`KeyManager::observe_group_version`]).

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use courier_crypto::{SymmetricKey, derive_direct_key, derive_group_key};
use tracing::{debug, info};

use crate::{
    error::CoreError,
    ids::{GroupId, UserId},
};

/// Version every group starts at.
pub const INITIAL_GROUP_VERSION: u32 = 1;

/// Cache slot for one derived key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySlot {
    /// Direct key for a canonical (sorted) pair
    Direct {
        /// Lexicographically smaller participant
        lo: UserId,
        /// Lexicographically larger participant
        hi: UserId,
    },
    /// Group key at one version
    Group {
        /// Group
        group_id: GroupId,
        /// Key version
        version: u32,
    },
}

impl KeySlot {
    /// Slot for the direct key between `a` and `b`, in either order.
    ///
    /// Sorted the same way as [`courier_crypto::canonical_pair`].
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self::Direct { lo: lo.clone(), hi: hi.clone() }
    }

    /// Slot for a group key version.
    pub fn group(group_id: &GroupId, version: u32) -> Self {
        Self::Group { group_id: group_id.clone(), version }
    }

    fn derive(&self) -> SymmetricKey {
        match self {
            Self::Direct { lo, hi } => derive_direct_key(lo.as_str(), hi.as_str()),
            Self::Group { group_id, version } => derive_group_key(group_id.as_str(), *version),
        }
    }
}

/// Storage for derived keys, injected into [`KeyManager`].
///
/// Entries are immutable once inserted and are pure functions of their slot,
/// so double inserts and lost entries are harmless.
pub trait KeyCache: Send + Sync {
    /// Cached key for `slot`, if present.
    fn get(&self, slot: &KeySlot) -> Option<SymmetricKey>;

    /// Cache `key` for `slot`.
    fn insert(&self, slot: KeySlot, key: SymmetricKey);

    /// Number of cached keys.
    fn len(&self) -> usize;

    /// Whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process [`KeyCache`] shared through an `Arc`.
///
/// Clones share entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyCache {
    entries: Arc<RwLock<HashMap<KeySlot, SymmetricKey>>>,
}

impl MemoryKeyCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyCache for MemoryKeyCache {
    fn get(&self, slot: &KeySlot) -> Option<SymmetricKey> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(slot).cloned()
    }

    fn insert(&self, slot: KeySlot, key: SymmetricKey) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(slot).or_insert(key);
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Derives, caches and versions conversation keys.
///
/// # Invariants
///
/// - The current version of a group never decreases
/// - Every version from [`INITIAL_GROUP_VERSION`] to the current one stays
///   derivable
pub struct KeyManager<C: KeyCache = MemoryKeyCache> {
    cache: C,
    group_versions: HashMap<GroupId, u32>,
}

impl Default for KeyManager<MemoryKeyCache> {
    fn default() -> Self {
        Self::new(MemoryKeyCache::new())
    }
}

impl<C: KeyCache> KeyManager<C> {
    /// Manager backed by `cache`.
    pub fn new(cache: C) -> Self {
        Self { cache, group_versions: HashMap::new() }
    }

    /// The injected cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Key shared by `self_id` and `peer_id`.
    ///
    /// Symmetric: both participants get the same key. Never fails.
    pub fn direct_key(&self, self_id: &UserId, peer_id: &UserId) -> SymmetricKey {
        self.get_or_derive(KeySlot::direct(self_id, peer_id))
    }

    /// Start tracking `group_id` at [`INITIAL_GROUP_VERSION`].
    ///
    /// Idempotent; returns the group's current version.
    pub fn register_group(&mut self, group_id: &GroupId) -> u32 {
        *self.group_versions.entry(group_id.clone()).or_insert_with(|| {
            debug!(group_id = %group_id, "group registered");
            INITIAL_GROUP_VERSION
        })
    }

    /// Adopt `version` announced for `group_id`, registering the group if
    /// needed. Never lowers the current version.
    ///
    /// Returns the current version afterwards.
    ///
    /// # Errors
    ///
    /// - `InvalidGroup` if `version` is 0
    pub fn observe_group_version(
        &mut self,
        group_id: &GroupId,
        version: u32,
    ) -> Result<u32, CoreError> {
        if version < INITIAL_GROUP_VERSION {
            return Err(CoreError::InvalidGroup {
                group_id: group_id.clone(),
                version: Some(version),
            });
        }

        let current = self.group_versions.entry(group_id.clone()).or_insert(version);
        if version > *current {
            debug!(group_id = %group_id, from = *current, to = version, "group version observed");
            *current = version;
        }
        Ok(*current)
    }

    /// Current key version of `group_id`, if registered.
    pub fn current_group_version(&self, group_id: &GroupId) -> Option<u32> {
        self.group_versions.get(group_id).copied()
    }

    /// Group key at `version`, or at the current version when `None`.
    ///
    /// Returns the key with the version it belongs to.
    ///
    /// # Errors
    ///
    /// - `InvalidGroup` if the group is not registered, or `version` is 0 or
    ///   newer than anything this manager has seen
    pub fn group_key(
        &self,
        group_id: &GroupId,
        version: Option<u32>,
    ) -> Result<(SymmetricKey, u32), CoreError> {
        let invalid = || CoreError::InvalidGroup { group_id: group_id.clone(), version };

        let current = self.current_group_version(group_id).ok_or_else(invalid)?;
        let version = version.unwrap_or(current);
        if !(INITIAL_GROUP_VERSION..=current).contains(&version) {
            return Err(invalid());
        }

        Ok((self.get_or_derive(KeySlot::group(group_id, version)), version))
    }

    /// Move `group_id` to the next key version and return its key.
    ///
    /// Earlier versions stay derivable. Authorization is the caller's job.
    ///
    /// # Errors
    ///
    /// - `InvalidGroup` if the group is not registered or the version space
    ///   is exhausted
    pub fn rotate_group_key(
        &mut self,
        group_id: &GroupId,
    ) -> Result<(SymmetricKey, u32), CoreError> {
        let invalid = || CoreError::InvalidGroup { group_id: group_id.clone(), version: None };

        let current = self.group_versions.get_mut(group_id).ok_or_else(invalid)?;
        let next = current.checked_add(1).ok_or_else(invalid)?;
        *current = next;

        info!(group_id = %group_id, version = next, "group key rotated");
        Ok((self.get_or_derive(KeySlot::group(group_id, next)), next))
    }

    fn get_or_derive(&self, slot: KeySlot) -> SymmetricKey {
        if let Some(key) = self.cache.get(&slot) {
            return key;
        }

        let key = slot.derive();
        self.cache.insert(slot, key.clone());
        key
    }
}

impl<C: KeyCache> std::fmt::Debug for KeyManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("cached_keys", &self.cache.len())
            .field("group_versions", &self.group_versions)
            .finish()
    }
}
