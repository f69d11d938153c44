//! Permission tiers, resolved sender capabilities, and the per-dispatch
//! decision cache.
//!
//! Capabilities are resolved from the user directory once per message. The
//! `PermissionCache` lives for exactly one dispatch: permission state may
//! change between messages, so decisions are never shared across them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::messaging::Sender;
use crate::users::{UserDirectory, UserRecord};

/// Ordered permission tiers, lowest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionTier {
    #[default]
    Viewer,
    Follower,
    Subscriber,
    Vip,
    Moderator,
    Caster,
}

impl PermissionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Follower => "follower",
            Self::Subscriber => "subscriber",
            Self::Vip => "vip",
            Self::Moderator => "moderator",
            Self::Caster => "caster",
        }
    }
}

impl std::fmt::Display for PermissionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine needs to know about a sender, resolved once
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderCapabilities {
    pub user_id: String,
    pub username: String,
    pub tier: PermissionTier,
    pub is_caster: bool,
    pub is_moderator: bool,
    pub is_vip: bool,
    pub is_subscriber: bool,
    pub is_follower: bool,
}

impl SenderCapabilities {
    /// Capabilities of a sender the directory does not know
    pub fn viewer(sender: &Sender) -> Self {
        Self {
            user_id: sender.id.clone(),
            username: sender.username.clone(),
            tier: PermissionTier::Viewer,
            is_caster: false,
            is_moderator: false,
            is_vip: false,
            is_subscriber: false,
            is_follower: false,
        }
    }

    fn from_record(record: &UserRecord, is_owner: bool) -> Self {
        let is_caster = record.is_caster || is_owner;
        let tier = if is_caster {
            PermissionTier::Caster
        } else if record.is_moderator {
            PermissionTier::Moderator
        } else if record.is_vip {
            PermissionTier::Vip
        } else if record.is_subscriber {
            PermissionTier::Subscriber
        } else if record.is_follower {
            PermissionTier::Follower
        } else {
            PermissionTier::Viewer
        };

        Self {
            user_id: record.id.clone(),
            username: record.username.clone(),
            tier,
            is_caster,
            is_moderator: record.is_moderator,
            is_vip: record.is_vip,
            is_subscriber: record.is_subscriber,
            is_follower: record.is_follower,
        }
    }

    pub fn satisfies(&self, required: PermissionTier) -> bool {
        self.tier >= required
    }

    /// Owner or moderator, the senders allowed to use `skip`
    pub fn is_privileged(&self) -> bool {
        self.is_caster || self.is_moderator
    }
}

/// Resolves sender capabilities against the user directory
pub struct PermissionResolver {
    directory: Arc<dyn UserDirectory>,
    owners: HashSet<String>,
}

impl PermissionResolver {
    pub fn new(directory: Arc<dyn UserDirectory>, owners: &[String]) -> Self {
        Self {
            directory,
            owners: owners.iter().map(|owner| owner.to_lowercase()).collect(),
        }
    }

    fn is_owner(&self, username: &str) -> bool {
        self.owners.contains(&username.to_lowercase())
    }

    /// Resolve a sender, falling back to the message's own identity when the
    /// directory has no record.
    pub async fn capabilities(&self, sender: &Sender) -> SenderCapabilities {
        match self.directory.find_user(&sender.id).await {
            Some(record) => SenderCapabilities::from_record(&record, self.is_owner(&record.username)),
            None => {
                let mut caps = SenderCapabilities::viewer(sender);
                if self.is_owner(&sender.username) {
                    caps.is_caster = true;
                    caps.tier = PermissionTier::Caster;
                }
                caps
            }
        }
    }

    /// Resolve a user by id alone
    pub async fn capabilities_by_id(&self, user_id: &str) -> Option<SenderCapabilities> {
        self.directory
            .find_user(user_id)
            .await
            .map(|record| SenderCapabilities::from_record(&record, self.is_owner(&record.username)))
    }

    /// Uncached permission check
    pub async fn check(&self, user_id: &str, required: PermissionTier) -> bool {
        if required == PermissionTier::Viewer {
            return true;
        }
        self.capabilities_by_id(user_id)
            .await
            .is_some_and(|caps| caps.satisfies(required))
    }
}

/// Per-dispatch memoisation of permission decisions keyed by
/// `(user_id, tier)`. Each user is looked up at most once.
pub struct PermissionCache {
    resolver: Arc<PermissionResolver>,
    capabilities: DashMap<String, Option<SenderCapabilities>>,
    decisions: DashMap<(String, PermissionTier), bool>,
    lookups: AtomicU64,
}

impl PermissionCache {
    pub fn new(resolver: Arc<PermissionResolver>) -> Self {
        Self {
            resolver,
            capabilities: DashMap::new(),
            decisions: DashMap::new(),
            lookups: AtomicU64::new(0),
        }
    }

    /// Create a cache seeded with the sender's already-resolved capabilities
    pub fn seeded(resolver: Arc<PermissionResolver>, sender: SenderCapabilities) -> Self {
        let cache = Self::new(resolver);
        cache
            .capabilities
            .insert(sender.user_id.clone(), Some(sender));
        cache
    }

    /// Resolve the sender and seed a fresh cache with the result.
    pub async fn for_sender(resolver: Arc<PermissionResolver>, sender: &Sender) -> Self {
        let caps = resolver.capabilities(sender).await;
        let cache = Self::seeded(resolver, caps);
        cache.lookups.fetch_add(1, Ordering::Relaxed);
        cache
    }

    pub async fn check(&self, user_id: &str, required: PermissionTier) -> bool {
        let key = (user_id.to_string(), required);
        if let Some(decision) = self.decisions.get(&key) {
            return *decision;
        }

        let caps = match self.capabilities.get(user_id).map(|entry| entry.clone()) {
            Some(caps) => caps,
            None => {
                self.lookups.fetch_add(1, Ordering::Relaxed);
                let caps = self.resolver.capabilities_by_id(user_id).await;
                self.capabilities.insert(user_id.to_string(), caps.clone());
                caps
            }
        };

        let allowed = required == PermissionTier::Viewer
            || caps.is_some_and(|caps| caps.satisfies(required));
        self.decisions.insert(key, allowed);

        tracing::trace!(
            user_id = %user_id,
            required = %required,
            allowed = allowed,
            "Permission decision cached"
        );

        allowed
    }

    /// Capabilities of a user already seen in this dispatch
    pub fn capabilities(&self, user_id: &str) -> Option<SenderCapabilities> {
        self.capabilities
            .get(user_id)
            .and_then(|entry| entry.clone())
    }

    /// Number of directory lookups performed by this cache
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}
