//! Deterministic key derivation using HKDF
//!
//! Keys are a pure function of public identifiers and a fixed namespace. Two
//! processes that agree on the identifiers derive the same key without
//! talking to each other.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::key::{KEY_SIZE, SymmetricKey};

/// Application namespace mixed into every derivation as the HKDF salt.
///
/// Build-time constant shared by all clients. Changing it makes every
/// previously derivable key underivable.
pub const KEY_NAMESPACE: &[u8] = b"courier/e2e/v1";

/// Separator between the components of a canonical label.
///
/// Identifiers are validated to never contain it, which keeps labels
/// collision-free.
pub const LABEL_SEPARATOR: char = ':';

/// HKDF info for direct conversation keys
const DIRECT_KEY_INFO: &[u8] = b"courier direct key";

/// HKDF info for group keys
const GROUP_KEY_INFO: &[u8] = b"courier group key";

/// Order two identifiers lexicographically.
///
/// Both sides of a conversation get the same pair regardless of which one
/// calls. Chat ids use the same ordering.
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Canonical label for the unordered pair `{a, b}`: `direct:<lo>:<hi>`.
pub fn direct_label(a: &str, b: &str) -> String {
    let (lo, hi) = canonical_pair(a, b);
    format!("direct{LABEL_SEPARATOR}{lo}{LABEL_SEPARATOR}{hi}")
}

/// Canonical label for a group key version: `group:<group>:v<version>`.
pub fn group_label(group_id: &str, version: u32) -> String {
    format!("group{LABEL_SEPARATOR}{group_id}{LABEL_SEPARATOR}v{version}")
}

/// Derive the key shared by two users.
///
/// Symmetric in its arguments: `derive_direct_key(a, b) ==
/// derive_direct_key(b, a)`.
pub fn derive_direct_key(a: &str, b: &str) -> SymmetricKey {
    derive(&direct_label(a, b), DIRECT_KEY_INFO)
}

/// Derive the key for `version` of a group.
///
/// Each version yields an independent key; older versions remain derivable.
pub fn derive_group_key(group_id: &str, version: u32) -> SymmetricKey {
    derive(&group_label(group_id, version), GROUP_KEY_INFO)
}

fn derive(label: &str, info: &[u8]) -> SymmetricKey {
    let hkdf = Hkdf::<Sha256>::new(Some(KEY_NAMESPACE), label.as_bytes());

    let mut okm = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(info, &mut okm) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    SymmetricKey::from_bytes(okm)
}
