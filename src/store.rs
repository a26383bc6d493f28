//! Persistence collaborator boundary.
//!
//! The coordination engine never owns durable state; it talks to an object
//! store through the `ObjectStore` trait and matches completions back to the
//! causal event by correlation key. `MemoryStore` is the reference backend
//! used by the dev server and the tests.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::AvatarId;

/// Length of a generated secret friend code.
const SECRET_LEN: usize = 6;

/// Errors surfaced by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored avatar record: display attributes plus the ordered friends list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarRecord {
    pub avatar_id: AvatarId,
    pub name: String,
    pub appearance: String,
    #[serde(default)]
    pub companion_id: AvatarId,
    #[serde(default)]
    pub friends: Vec<AvatarId>,
}

/// A stored companion record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionRecord {
    pub companion_id: AvatarId,
    pub name: String,
    pub owner_id: AvatarId,
}

/// A record resolved by id, tagged with its declared kind.
#[derive(Debug, Clone)]
pub enum Record {
    Avatar(AvatarRecord),
    Companion(CompanionRecord),
}

/// Outcome of resolving a submitted secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretResolution {
    /// The secret belongs to the carried avatar; a friendship commit should
    /// follow. The secret is consumed.
    Matched(AvatarId),
    /// The secret is unknown or has expired.
    Unknown,
    /// The submitter consumed their own secret.
    SelfConsumed,
}

/// The persistence collaborator the coordination engine depends on.
///
/// Every method completes asynchronously; callers correlate completions to
/// the causal event themselves (the coordinator keys friendship commits by
/// negotiation context).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Resolve one record by id. `Ok(None)` means not found; `Err` is a
    /// backend failure.
    async fn query_record(&self, id: AvatarId) -> StoreResult<Option<Record>>;

    /// Commit a bidirectional friendship. `Ok(true)` on success, `Ok(false)`
    /// when either record is missing or either friends list is full.
    async fn commit_friendship(
        &self,
        avatar_a: AvatarId,
        avatar_b: AvatarId,
        flags: u32,
    ) -> StoreResult<bool>;

    /// Resolve (and consume) a submitted secret for the given avatar.
    async fn resolve_secret(&self, avatar_id: AvatarId, secret: &str)
        -> StoreResult<SecretResolution>;

    /// Issue a new secret owned by the given avatar. `Ok(None)` means the
    /// avatar has too many secrets outstanding.
    async fn issue_secret(&self, avatar_id: AvatarId) -> StoreResult<Option<String>>;
}

/// In-memory reference store.
pub struct MemoryStore {
    records: DashMap<AvatarId, Record>,
    secrets: DashMap<String, AvatarId>,
    outstanding: DashMap<AvatarId, usize>,
    max_friends: usize,
    max_secrets_per_avatar: usize,
}

impl MemoryStore {
    pub fn new(max_friends: usize, max_secrets_per_avatar: usize) -> Self {
        Self {
            records: DashMap::new(),
            secrets: DashMap::new(),
            outstanding: DashMap::new(),
            max_friends,
            max_secrets_per_avatar,
        }
    }

    pub fn insert_avatar(&self, record: AvatarRecord) {
        self.records.insert(record.avatar_id, Record::Avatar(record));
    }

    pub fn insert_companion(&self, record: CompanionRecord) {
        self.records
            .insert(record.companion_id, Record::Companion(record));
    }

    fn friends_list_has_room(&self, id: AvatarId, other: AvatarId) -> bool {
        match self.records.get(&id).as_deref() {
            Some(Record::Avatar(record)) => {
                record.friends.contains(&other) || record.friends.len() < self.max_friends
            }
            _ => false,
        }
    }

    fn append_friend(&self, id: AvatarId, friend_id: AvatarId) {
        if let Some(mut entry) = self.records.get_mut(&id) {
            if let Record::Avatar(record) = entry.value_mut() {
                if !record.friends.contains(&friend_id) {
                    record.friends.push(friend_id);
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn query_record(&self, id: AvatarId) -> StoreResult<Option<Record>> {
        Ok(self.records.get(&id).map(|entry| entry.value().clone()))
    }

    async fn commit_friendship(
        &self,
        avatar_a: AvatarId,
        avatar_b: AvatarId,
        _flags: u32,
    ) -> StoreResult<bool> {
        if !self.friends_list_has_room(avatar_a, avatar_b)
            || !self.friends_list_has_room(avatar_b, avatar_a)
        {
            return Ok(false);
        }
        self.append_friend(avatar_a, avatar_b);
        self.append_friend(avatar_b, avatar_a);
        Ok(true)
    }

    async fn resolve_secret(
        &self,
        avatar_id: AvatarId,
        secret: &str,
    ) -> StoreResult<SecretResolution> {
        let Some((_, owner)) = self.secrets.remove(secret) else {
            return Ok(SecretResolution::Unknown);
        };
        if let Some(mut count) = self.outstanding.get_mut(&owner) {
            *count = count.saturating_sub(1);
        }
        if owner == avatar_id {
            Ok(SecretResolution::SelfConsumed)
        } else {
            Ok(SecretResolution::Matched(owner))
        }
    }

    async fn issue_secret(&self, avatar_id: AvatarId) -> StoreResult<Option<String>> {
        let mut count = self.outstanding.entry(avatar_id).or_insert(0);
        if *count >= self.max_secrets_per_avatar {
            return Ok(None);
        }
        *count += 1;
        drop(count);

        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LEN)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        self.secrets.insert(secret.clone(), avatar_id);
        Ok(Some(secret))
    }
}
