//! Work queue for fire-and-forget handlers.
//!
//! The dispatcher pushes jobs onto an unbounded channel and never waits for
//! them. A worker task spawns one task per job. Completion order is
//! unspecified and failures are logged, never surfaced.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::messaging::MessageSink;
use crate::metrics::{DETACHED_TASKS_TOTAL, HANDLER_FAILURES_TOTAL};

use super::handler::Invocation;
use super::registry::CommandRegistration;

pub struct DetachedJob {
    pub registration: Arc<CommandRegistration>,
    pub invocation: Invocation,
    /// Drop responses instead of delivering them
    pub quiet: bool,
}

#[derive(Debug, Default)]
struct DetachedStats {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of detached queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct DetachedStatsSnapshot {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
}

pub struct DetachedQueue {
    sender: mpsc::UnboundedSender<DetachedJob>,
    stats: Arc<DetachedStats>,
}

impl DetachedQueue {
    /// Start the worker. Must be called inside a Tokio runtime.
    pub fn start(sink: Arc<dyn MessageSink>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(DetachedStats::default());

        let worker = tokio::spawn(run_worker(receiver, sink, stats.clone()));

        (Self { sender, stats }, worker)
    }

    /// Queue a job. Returns `false` if the worker has stopped.
    pub fn push(&self, job: DetachedJob) -> bool {
        let name = job.registration.name.clone();
        match self.sender.send(job) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                DETACHED_TASKS_TOTAL.inc();
                true
            }
            Err(_) => {
                tracing::error!(handler = %name, "Detached queue closed, dropping job");
                false
            }
        }
    }

    pub fn stats(&self) -> DetachedStatsSnapshot {
        DetachedStatsSnapshot {
            queued: self.stats.queued.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<DetachedJob>,
    sink: Arc<dyn MessageSink>,
    stats: Arc<DetachedStats>,
) {
    tracing::debug!("Detached queue worker started");

    while let Some(job) = receiver.recv().await {
        tokio::spawn(run_job(job, sink.clone(), stats.clone()));
    }

    tracing::debug!("Detached queue worker stopped");
}

async fn run_job(job: DetachedJob, sink: Arc<dyn MessageSink>, stats: Arc<DetachedStats>) {
    let DetachedJob {
        registration,
        invocation,
        quiet,
    } = job;
    let dispatch_id = invocation.dispatch_id;

    let result = AssertUnwindSafe(registration.handler.handle(invocation))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(outcome)) => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
            if quiet {
                return;
            }
            for response in outcome.responses {
                sink.deliver(response).await;
            }
        }
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            HANDLER_FAILURES_TOTAL.with_label_values(&["error"]).inc();
            tracing::error!(
                dispatch_id = %dispatch_id,
                handler = %registration.name,
                error = %e,
                "Detached handler failed"
            );
        }
        Err(_) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            HANDLER_FAILURES_TOTAL.with_label_values(&["panic"]).inc();
            tracing::error!(
                dispatch_id = %dispatch_id,
                handler = %registration.name,
                "Detached handler panicked"
            );
        }
    }
}
