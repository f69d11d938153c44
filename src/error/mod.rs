use thiserror::Error;

use crate::telemetry::TelemetryError;
use crate::template::RegistryError;
use crate::variables::VariableError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Variable error: {0}")]
    Variable(#[from] VariableError),

    #[error("Filter registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
