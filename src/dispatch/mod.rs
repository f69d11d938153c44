//! Command dispatch pipeline: registry, handler contract, rollback log,
//! detached queue and the dispatcher that ties them together.

mod detached;
mod dispatcher;
mod handler;
mod registry;
mod rollback;

pub use detached::{DetachedJob, DetachedQueue, DetachedStatsSnapshot};
pub use dispatcher::{
    DispatchOutcome, DispatchState, Dispatcher, DispatcherStats, DispatcherStatsSnapshot,
};
pub use handler::{CommandHandler, HandlerOutcome, Invocation};
pub use registry::{
    CommandPattern, CommandRegistration, CommandRegistry, ExecutionMode, PlannedInvocation,
    Priority,
};
pub use rollback::{PendingRollback, RollbackEntry, RollbackManager};
