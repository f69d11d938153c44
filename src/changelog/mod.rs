//! Append-only changelog scoped per resource id.
//!
//! Backs variable history and points undo. Each resource keeps a `VecDeque`
//! of entries, oldest first; entries older than the retention window or past
//! the per-resource cap are dropped on write and by `prune`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Retention policy for a changelog
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Maximum age of an entry
    pub max_age: Duration,
    /// Maximum number of entries kept per resource
    pub max_entries: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(86400),
            max_entries: 50,
        }
    }
}

/// A single recorded change
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEntry<T> {
    /// The change payload
    pub change: T,
    /// Who caused the change
    pub actor: String,
    /// When the change was recorded
    pub recorded_at: DateTime<Utc>,
}

impl<T> ChangeEntry<T> {
    fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.recorded_at);
        age.to_std().map(|age| age > max_age).unwrap_or(false)
    }
}

pub struct Changelog<T> {
    entries: DashMap<String, VecDeque<ChangeEntry<T>>>,
    policy: RetentionPolicy,
}

impl<T: Clone> Changelog<T> {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Append a change for a resource.
    pub fn record(&self, resource: &str, actor: &str, change: T) {
        self.record_at(resource, actor, change, Utc::now());
    }

    fn record_at(&self, resource: &str, actor: &str, change: T, now: DateTime<Utc>) {
        let mut log = self.entries.entry(resource.to_string()).or_default();

        while log
            .front()
            .is_some_and(|entry| entry.is_expired(self.policy.max_age, now))
        {
            log.pop_front();
        }

        if self.policy.max_entries > 0 && log.len() >= self.policy.max_entries {
            log.pop_front();
        }

        log.push_back(ChangeEntry {
            change,
            actor: actor.to_string(),
            recorded_at: now,
        });
    }

    /// Entries for a resource still inside the retention window, oldest first.
    pub fn entries(&self, resource: &str) -> Vec<ChangeEntry<T>> {
        let now = Utc::now();
        self.entries
            .get(resource)
            .map(|log| {
                log.iter()
                    .filter(|entry| !entry.is_expired(self.policy.max_age, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent live entry for a resource.
    pub fn last(&self, resource: &str) -> Option<ChangeEntry<T>> {
        let now = Utc::now();
        self.entries.get(resource).and_then(|log| {
            log.back()
                .filter(|entry| !entry.is_expired(self.policy.max_age, now))
                .cloned()
        })
    }

    /// Remove and return the most recent entry if it is still inside the
    /// retention window.
    pub fn pop_last(&self, resource: &str) -> Option<ChangeEntry<T>> {
        let now = Utc::now();
        let mut log = self.entries.get_mut(resource)?;
        if log
            .back()
            .is_some_and(|entry| !entry.is_expired(self.policy.max_age, now))
        {
            log.pop_back()
        } else {
            None
        }
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;

        self.entries.retain(|_, log| {
            let before = log.len();
            log.retain(|entry| !entry.is_expired(self.policy.max_age, now));
            removed += before - log.len();
            !log.is_empty()
        });

        if removed > 0 {
            tracing::debug!(removed = removed, "Pruned expired changelog entries");
        }

        removed
    }

    /// Forget everything recorded for a resource.
    pub fn clear(&self, resource: &str) {
        self.entries.remove(resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_entries() {
        let log: Changelog<i64> = Changelog::new(RetentionPolicy::default());
        log.record("user-1", "bot", 10);
        log.record("user-1", "bot", -5);
        log.record("user-2", "bot", 3);

        let entries = log.entries("user-1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].change, 10);
        assert_eq!(entries[1].change, -5);
        assert_eq!(log.last("user-2").map(|e| e.change), Some(3));
    }

    #[test]
    fn test_max_entries_bound() {
        let log: Changelog<u32> = Changelog::new(RetentionPolicy {
            max_age: Duration::from_secs(60),
            max_entries: 3,
        });

        for i in 0..5 {
            log.record("res", "admin", i);
        }

        let changes: Vec<u32> = log.entries("res").into_iter().map(|e| e.change).collect();
        assert_eq!(changes, vec![2, 3, 4]);
    }

    #[test]
    fn test_expired_entries_are_hidden_and_pruned() {
        let log: Changelog<u32> = Changelog::new(RetentionPolicy {
            max_age: Duration::from_secs(60),
            max_entries: 10,
        });

        let old = Utc::now() - chrono::Duration::seconds(120);
        log.record_at("stale", "admin", 1, old);
        log.record("fresh", "admin", 2);

        assert!(log.entries("stale").is_empty());
        assert_eq!(log.entries("fresh").len(), 1);
        assert_eq!(log.prune(), 1);
        assert_eq!(log.prune(), 0);
    }

    #[test]
    fn test_write_drops_expired_front() {
        let log: Changelog<u32> = Changelog::new(RetentionPolicy {
            max_age: Duration::from_secs(60),
            max_entries: 10,
        });

        let old = Utc::now() - chrono::Duration::seconds(120);
        log.record_at("res", "admin", 1, old);
        log.record("res", "admin", 2);

        let changes: Vec<u32> = log.entries("res").into_iter().map(|e| e.change).collect();
        assert_eq!(changes, vec![2]);
        assert_eq!(log.prune(), 0);
    }

    #[test]
    fn test_pop_last_respects_window() {
        let log: Changelog<u32> = Changelog::new(RetentionPolicy {
            max_age: Duration::from_secs(60),
            max_entries: 10,
        });

        let old = Utc::now() - chrono::Duration::seconds(120);
        log.record_at("stale", "admin", 1, old);
        assert!(log.pop_last("stale").is_none());

        log.record("fresh", "admin", 7);
        assert_eq!(log.pop_last("fresh").map(|e| e.change), Some(7));
        assert!(log.pop_last("fresh").is_none());
    }
}
