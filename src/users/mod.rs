//! User directory collaborator.
//!
//! The engine only reads users: permission resolution and `random.*` draws.
//! `MemoryUserDirectory` is the in-process implementation used by the demo
//! binary and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A user as known to the persistence layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub is_follower: bool,
    #[serde(default)]
    pub is_subscriber: bool,
    #[serde(default)]
    pub is_vip: bool,
    #[serde(default)]
    pub is_moderator: bool,
    #[serde(default)]
    pub is_caster: bool,
    #[serde(default)]
    pub is_online: bool,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn online(mut self) -> Self {
        self.is_online = true;
        self
    }

    pub fn follower(mut self) -> Self {
        self.is_follower = true;
        self
    }

    pub fn subscriber(mut self) -> Self {
        self.is_subscriber = true;
        self
    }

    pub fn vip(mut self) -> Self {
        self.is_vip = true;
        self
    }

    pub fn moderator(mut self) -> Self {
        self.is_moderator = true;
        self
    }

    pub fn caster(mut self) -> Self {
        self.is_caster = true;
        self
    }
}

/// Predicate over the user pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserFilter {
    pub online_only: bool,
    pub followers_only: bool,
    pub subscribers_only: bool,
}

impl UserFilter {
    pub fn matches(&self, user: &UserRecord) -> bool {
        (!self.online_only || user.is_online)
            && (!self.followers_only || user.is_follower)
            && (!self.subscribers_only || user.is_subscriber)
    }
}

/// Read access to persisted users
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up a user by id
    async fn find_user(&self, id: &str) -> Option<UserRecord>;

    /// Ids of every user matching the filter
    async fn list_user_ids(&self, filter: UserFilter) -> Vec<String>;
}

/// In-memory user directory
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: DashMap<String, UserRecord>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user
    pub fn upsert(&self, user: UserRecord) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn remove(&self, id: &str) -> Option<UserRecord> {
        self.users.remove(id).map(|(_, user)| user)
    }

    pub fn set_online(&self, id: &str, online: bool) -> bool {
        match self.users.get_mut(id) {
            Some(mut user) => {
                user.is_online = online;
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_user(&self, id: &str) -> Option<UserRecord> {
        self.users.get(id).map(|user| user.clone())
    }

    async fn list_user_ids(&self, filter: UserFilter) -> Vec<String> {
        self.users
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.key().clone())
            .collect()
    }
}
