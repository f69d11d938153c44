//! Custom variables referenced from templates as `$_name`.
//!
//! # Backend Architecture
//!
//! - `MemoryVariableBackend`: In-memory storage using DashMap (default)
//! - `RedisVariableBackend`: Persistent storage using one Redis hash per variable
//!
//! Use `create_variable_backend()` to pick a backend from configuration.

pub mod backend;
pub mod memory_backend;
pub mod redis_backend;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use crate::changelog::RetentionPolicy;
use crate::config::VariableStoreConfig;

pub use backend::{VariableBackend, VariableBackendError};
pub use memory_backend::MemoryVariableBackend;
pub use redis_backend::RedisVariableBackend;
pub use store::{ResolveRequest, VariableStore};
pub use types::{
    format_number, parse_number, validate_name, CreateVariableRequest, CustomVariable,
    Resolution, ResponseType, UpdateVariableRequest, VariableChange, VariableError,
    VariableKind, VariableNotification, VariableResult, VARIABLE_PREFIX,
};

/// Create a variable backend based on configuration.
///
/// - `"redis"`: Returns a `RedisVariableBackend`, or falls back to memory if
///   the URL is invalid
/// - `"memory"` (default): Returns a `MemoryVariableBackend`
pub fn create_variable_backend(settings: &VariableStoreConfig) -> Arc<dyn VariableBackend> {
    match settings.backend.as_str() {
        "redis" => match RedisVariableBackend::new(&settings.redis_url, settings.redis_prefix.clone()) {
            Ok(backend) => {
                tracing::info!(
                    backend = "redis",
                    prefix = %settings.redis_prefix,
                    "Creating Redis variable backend"
                );
                Arc::new(backend)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Redis variable backend unavailable, falling back to memory backend"
                );
                Arc::new(MemoryVariableBackend::new())
            }
        },
        "memory" => {
            tracing::info!(backend = "memory", "Creating in-memory variable backend");
            Arc::new(MemoryVariableBackend::new())
        }
        other => {
            tracing::warn!(
                backend = %other,
                "Unknown variable backend type, using memory backend"
            );
            Arc::new(MemoryVariableBackend::new())
        }
    }
}

/// Build a store from configuration.
pub fn create_variable_store(settings: &VariableStoreConfig) -> Arc<VariableStore> {
    let retention = RetentionPolicy {
        max_age: Duration::from_secs(settings.history_retention_seconds),
        max_entries: settings.history_max_entries,
    };

    Arc::new(VariableStore::new(
        create_variable_backend(settings),
        retention,
        settings.default_notification.clone(),
    ))
}
