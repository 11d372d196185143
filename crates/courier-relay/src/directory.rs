//! Group directory: membership, roles and key versions.
//!
//! The relay is the authorization point for group key rotation. Only owners
//! and admins may rotate; the directory records the resulting version so that
//! submissions sealed under a version nobody announced are refused.
//!
//! Groups must be explicitly created (no lazy creation).

use std::collections::{BTreeMap, HashMap};

use courier_core::{GroupId, INITIAL_GROUP_VERSION, Timestamp, UserId};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Member role within a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creator; one per group
    Owner,
    /// May rotate the group key
    Admin,
    /// Regular member
    #[default]
    Member,
}

impl Role {
    /// Whether this role may rotate the group key.
    pub fn can_rotate(self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

/// Persisted directory entry for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    /// Group
    pub group_id: GroupId,
    /// Creator
    pub owner: UserId,
    /// Current members and their roles
    pub members: BTreeMap<UserId, Role>,
    /// Current key version
    pub key_version: u32,
    /// Creation time
    pub created_at: Timestamp,
}

/// All groups the relay serves.
#[derive(Debug, Clone, Default)]
pub struct GroupDirectory {
    groups: HashMap<GroupId, GroupRecord>,
    max_group_size: usize,
}

impl GroupDirectory {
    /// Empty directory admitting at most `max_group_size` members per group.
    pub fn new(max_group_size: usize) -> Self {
        Self { groups: HashMap::new(), max_group_size }
    }

    /// Create a group owned by `owner` with `members` as plain members.
    ///
    /// The owner is added even if missing from `members`; duplicates collapse.
    ///
    /// # Errors
    ///
    /// - `GroupExists` if the id is taken
    /// - `GroupFull` if the member list exceeds the size limit
    pub fn create(
        &mut self,
        group_id: &GroupId,
        owner: &UserId,
        members: &[UserId],
        at: Timestamp,
    ) -> Result<&GroupRecord, RelayError> {
        if self.groups.contains_key(group_id) {
            return Err(RelayError::GroupExists(group_id.clone()));
        }

        let mut roster: BTreeMap<UserId, Role> =
            members.iter().map(|member| (member.clone(), Role::Member)).collect();
        roster.insert(owner.clone(), Role::Owner);
        if roster.len() > self.max_group_size {
            return Err(RelayError::GroupFull {
                group_id: group_id.clone(),
                limit: self.max_group_size,
            });
        }

        let record = GroupRecord {
            group_id: group_id.clone(),
            owner: owner.clone(),
            members: roster,
            key_version: INITIAL_GROUP_VERSION,
            created_at: at,
        };
        Ok(self.groups.entry(group_id.clone()).or_insert(record))
    }

    /// Add `user_id` with `role`. Returns false if already a member.
    ///
    /// # Errors
    ///
    /// - `UnknownGroup` if the group does not exist
    /// - `NotAuthorized` if `role` is `Owner`
    /// - `GroupFull` if the group is at its size limit
    pub fn join(
        &mut self,
        group_id: &GroupId,
        user_id: &UserId,
        role: Role,
    ) -> Result<bool, RelayError> {
        let limit = self.max_group_size;
        let group = self.get_mut(group_id)?;
        if role == Role::Owner {
            return Err(RelayError::NotAuthorized {
                group_id: group_id.clone(),
                user_id: user_id.clone(),
            });
        }
        if group.members.contains_key(user_id) {
            return Ok(false);
        }
        if group.members.len() >= limit {
            return Err(RelayError::GroupFull { group_id: group_id.clone(), limit });
        }

        group.members.insert(user_id.clone(), role);
        Ok(true)
    }

    /// Remove `user_id`. Returns false if not a member.
    ///
    /// # Errors
    ///
    /// - `UnknownGroup` if the group does not exist
    pub fn leave(&mut self, group_id: &GroupId, user_id: &UserId) -> Result<bool, RelayError> {
        Ok(self.get_mut(group_id)?.members.remove(user_id).is_some())
    }

    /// Current members, sorted.
    ///
    /// # Errors
    ///
    /// - `UnknownGroup` if the group does not exist
    pub fn members(&self, group_id: &GroupId) -> Result<Vec<UserId>, RelayError> {
        Ok(self.get(group_id)?.members.keys().cloned().collect())
    }

    /// `user_id`'s role, if a member.
    pub fn role(&self, group_id: &GroupId, user_id: &UserId) -> Option<Role> {
        self.groups.get(group_id)?.members.get(user_id).copied()
    }

    /// Fail unless `user_id` is a member.
    ///
    /// # Errors
    ///
    /// - `UnknownGroup` if the group does not exist
    /// - `NotAMember` if `user_id` is not a member
    pub fn require_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<Role, RelayError> {
        self.get(group_id)?.members.get(user_id).copied().ok_or_else(|| RelayError::NotAMember {
            group_id: group_id.clone(),
            user_id: user_id.clone(),
        })
    }

    /// Advance the group's key version on behalf of `requested_by`.
    ///
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// - `UnknownGroup`/`NotAMember` as for [`Self::require_member`]
    /// - `NotAuthorized` if the requester is a plain member
    /// - `VersionExhausted` if the version cannot be incremented
    pub fn rotate(&mut self, group_id: &GroupId, requested_by: &UserId) -> Result<u32, RelayError> {
        let role = self.require_member(group_id, requested_by)?;
        if !role.can_rotate() {
            return Err(RelayError::NotAuthorized {
                group_id: group_id.clone(),
                user_id: requested_by.clone(),
            });
        }

        let group = self.get_mut(group_id)?;
        let next = group
            .key_version
            .checked_add(1)
            .ok_or_else(|| RelayError::VersionExhausted(group_id.clone()))?;
        group.key_version = next;
        Ok(next)
    }

    /// Directory record for a group.
    ///
    /// # Errors
    ///
    /// - `UnknownGroup` if the group does not exist
    pub fn get(&self, group_id: &GroupId) -> Result<&GroupRecord, RelayError> {
        self.groups.get(group_id).ok_or_else(|| RelayError::UnknownGroup(group_id.clone()))
    }

    fn get_mut(&mut self, group_id: &GroupId) -> Result<&mut GroupRecord, RelayError> {
        self.groups.get_mut(group_id).ok_or_else(|| RelayError::UnknownGroup(group_id.clone()))
    }

    /// Reinstate a persisted record, replacing any in-memory one.
    pub fn restore(&mut self, record: GroupRecord) {
        self.groups.insert(record.group_id.clone(), record);
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no groups exist.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
