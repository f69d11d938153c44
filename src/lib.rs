// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Collaborators
pub mod changelog;
pub mod locale;
pub mod messaging;
pub mod moderation;
pub mod users;

// Response template engine
pub mod permission;
pub mod template;
pub mod variables;

// Command dispatch pipeline
pub mod dispatch;
pub mod handlers;

pub use config::Settings;
pub use dispatch::{DispatchOutcome, DispatchState, Dispatcher};
pub use error::{EngineError, Result};
pub use template::{RenderContext, RenderOutput, ResponseEngine};
