//! Per-dispatch compensation log.
//!
//! A handler that pre-charges a resource registers a compensating action.
//! If a later awaited handler in the same dispatch fails, the dispatcher
//! replays every pending action; otherwise they are discarded when the
//! dispatch ends.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;

use crate::metrics::ROLLBACKS_REPLAYED_TOTAL;

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub struct RollbackEntry {
    /// Resource type, e.g. `points`. One entry per resource is kept.
    pub resource: String,
    pub amount: i64,
    /// User the resource belongs to
    pub owner: String,
    action: Compensation,
}

impl RollbackEntry {
    pub fn new<F, Fut>(
        resource: impl Into<String>,
        owner: impl Into<String>,
        amount: i64,
        action: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            resource: resource.into(),
            amount,
            owner: owner.into(),
            action: Box::new(move || action().boxed()),
        }
    }
}

impl std::fmt::Debug for RollbackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackEntry")
            .field("resource", &self.resource)
            .field("amount", &self.amount)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Description of a pending compensation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingRollback {
    pub resource: String,
    pub amount: i64,
    pub owner: String,
}

#[derive(Default)]
pub struct RollbackManager {
    entries: Mutex<Vec<RollbackEntry>>,
}

impl RollbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RollbackEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a compensation. Replaces any pending entry for the same
    /// resource.
    pub fn register(&self, entry: RollbackEntry) {
        let mut entries = self.lock();
        if let Some(pos) = entries.iter().position(|e| e.resource == entry.resource) {
            let replaced = entries.remove(pos);
            tracing::debug!(
                resource = %replaced.resource,
                owner = %replaced.owner,
                amount = replaced.amount,
                "Replacing pending rollback entry"
            );
        }
        entries.push(entry);
    }

    pub fn pending(&self) -> Vec<PendingRollback> {
        self.lock()
            .iter()
            .map(|entry| PendingRollback {
                resource: entry.resource.clone(),
                amount: entry.amount,
                owner: entry.owner.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run every pending compensation, newest first. Failures are logged.
    /// Returns the number of entries replayed.
    pub async fn replay(&self) -> usize {
        let entries = std::mem::take(&mut *self.lock());
        let count = entries.len();

        for entry in entries.into_iter().rev() {
            let RollbackEntry {
                resource,
                amount,
                owner,
                action,
            } = entry;

            match action().await {
                Ok(()) => {
                    ROLLBACKS_REPLAYED_TOTAL.inc();
                    tracing::info!(
                        resource = %resource,
                        owner = %owner,
                        amount,
                        "Rollback replayed"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        resource = %resource,
                        owner = %owner,
                        amount,
                        error = %e,
                        "Rollback compensation failed"
                    );
                }
            }
        }

        count
    }

    /// Drop every pending compensation. Returns the number dropped.
    pub fn discard(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }
}
