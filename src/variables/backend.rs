//! Backend trait for custom variable persistence.
//!
//! Template mutations go through `set_value` and `atomic_increment` only.
//! Implementations must make both atomic: the engine does not lock a
//! variable across the gap between its permission check and the write.

use async_trait::async_trait;
use thiserror::Error;

use super::types::CustomVariable;

/// Errors that can occur during variable backend operations.
#[derive(Debug, Error)]
pub enum VariableBackendError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored value or increment result is not a finite number
    #[error("Not a finite number: {0}")]
    NotNumeric(String),

    /// Backend is temporarily unavailable
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait VariableBackend: Send + Sync {
    /// Backend name for logs
    fn backend_type(&self) -> &'static str;

    async fn get(&self, name: &str) -> Result<Option<CustomVariable>, VariableBackendError>;

    async fn list(&self) -> Result<Vec<CustomVariable>, VariableBackendError>;

    /// Insert a new variable. Returns `false` if the name is taken.
    async fn insert(&self, variable: CustomVariable) -> Result<bool, VariableBackendError>;

    /// Replace an existing definition including its value. Returns `false`
    /// if the variable does not exist.
    async fn replace(&self, variable: CustomVariable) -> Result<bool, VariableBackendError>;

    async fn delete(&self, name: &str) -> Result<bool, VariableBackendError>;

    /// Atomically swap the value. Returns the previous value, or `None` if
    /// the variable does not exist.
    async fn set_value(
        &self,
        name: &str,
        value: &str,
    ) -> Result<Option<String>, VariableBackendError>;

    /// Atomically add `delta` to a numeric value. Returns the new value, or
    /// `None` if the variable does not exist. Fails with `NotNumeric` and
    /// leaves the value untouched when it or the sum is not finite.
    async fn atomic_increment(
        &self,
        name: &str,
        delta: f64,
    ) -> Result<Option<f64>, VariableBackendError>;
}
