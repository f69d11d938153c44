//! Custom variable types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::permission::PermissionTier;

use super::backend::VariableBackendError;

/// Prefix every custom variable name carries
pub const VARIABLE_PREFIX: &str = "$_";

/// Maximum length of the part after the prefix
const MAX_NAME_LEN: usize = 64;

/// Variable-specific error type
#[derive(Debug, Error)]
pub enum VariableError {
    #[error("Variable not found: {0}")]
    NotFound(String),

    #[error("Variable already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid variable name: {0}")]
    InvalidName(String),

    #[error("Invalid variable value: {0}")]
    InvalidValue(String),

    #[error("Variable backend error: {0}")]
    Backend(#[from] VariableBackendError),
}

/// Result type for variable operations
pub type VariableResult<T> = Result<T, VariableError>;

/// Value type of a custom variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    Number,
    #[default]
    Text,
    /// Computed outside the engine; never mutated by templates
    Eval,
}

/// How a successful template mutation shows up
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "text", rename_all = "lowercase")]
pub enum ResponseType {
    /// Substitute the new value in-line, no notification
    Inline,
    /// Keep the old value in the text and emit the default notification
    #[default]
    Announce,
    /// Keep the old value in the text and emit this notification text
    Custom(String),
}

/// A persisted custom variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomVariable {
    /// Unique name including the `$_` prefix
    pub name: String,

    #[serde(default)]
    pub kind: VariableKind,

    #[serde(default)]
    pub current_value: String,

    /// Amount applied by the `+` and `-` operands
    #[serde(default = "default_step")]
    pub step: f64,

    /// Minimum tier allowed to mutate through templates
    #[serde(default)]
    pub permission: PermissionTier,

    /// Blocks every template mutation regardless of permission
    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub response_type: ResponseType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_step() -> f64 {
    1.0
}

/// Check a full variable name (`$_` + alphanumerics/underscores)
pub fn validate_name(name: &str) -> VariableResult<()> {
    let Some(rest) = name.strip_prefix(VARIABLE_PREFIX) else {
        return Err(VariableError::InvalidName(format!(
            "{} must start with {}",
            name, VARIABLE_PREFIX
        )));
    };

    if rest.is_empty() || rest.len() > MAX_NAME_LEN {
        return Err(VariableError::InvalidName(format!(
            "Name must have 1-{} characters after {}",
            MAX_NAME_LEN, VARIABLE_PREFIX
        )));
    }

    if !rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(VariableError::InvalidName(
            "Name must contain only alphanumeric characters or underscore".to_string(),
        ));
    }

    Ok(())
}

impl CustomVariable {
    /// Validate the variable definition
    pub fn validate(&self) -> VariableResult<()> {
        validate_name(&self.name)?;

        if self.kind == VariableKind::Number {
            if parse_number(&self.current_value).is_none() {
                return Err(VariableError::InvalidValue(format!(
                    "{} is not a number",
                    self.current_value
                )));
            }
            if !self.step.is_finite() || self.step == 0.0 {
                return Err(VariableError::InvalidValue(
                    "Step must be a finite, non-zero number".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Parse a finite number from variable text
pub fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Format a number the way variables store it: integers without a fraction,
/// everything else rounded to ten decimal places. Magnitudes from 1e15 up
/// are written in full since scaling them could overflow.
pub fn format_number(value: f64) -> String {
    if value.abs() >= 1e15 {
        format!("{}", value)
    } else if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let rounded = (value * 1e10).round() / 1e10;
        format!("{}", rounded)
    }
}

/// Request to create a new variable
#[derive(Debug, Clone, Deserialize)]
pub struct CreateVariableRequest {
    pub name: String,

    #[serde(default)]
    pub kind: VariableKind,

    /// Initial value (defaults to `0` for numbers, empty otherwise)
    pub current_value: Option<String>,

    pub step: Option<f64>,

    #[serde(default)]
    pub permission: PermissionTier,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub response_type: ResponseType,

    pub description: Option<String>,
}

impl CreateVariableRequest {
    pub fn new(name: impl Into<String>, kind: VariableKind) -> Self {
        Self {
            name: name.into(),
            kind,
            current_value: None,
            step: None,
            permission: PermissionTier::default(),
            read_only: false,
            response_type: ResponseType::default(),
            description: None,
        }
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.current_value = Some(value.into());
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn permission(mut self, permission: PermissionTier) -> Self {
        self.permission = permission;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }
}

impl From<CreateVariableRequest> for CustomVariable {
    fn from(req: CreateVariableRequest) -> Self {
        let now = Utc::now();
        let current_value = req.current_value.unwrap_or_else(|| match req.kind {
            VariableKind::Number => "0".to_string(),
            _ => String::new(),
        });

        CustomVariable {
            name: req.name,
            kind: req.kind,
            current_value,
            step: req.step.unwrap_or_else(default_step),
            permission: req.permission,
            read_only: req.read_only,
            response_type: req.response_type,
            description: req.description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Request to update an existing variable
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateVariableRequest {
    pub kind: Option<VariableKind>,
    pub current_value: Option<String>,
    pub step: Option<f64>,
    pub permission: Option<PermissionTier>,
    pub read_only: Option<bool>,
    pub response_type: Option<ResponseType>,
    /// Use `Some(None)` to clear
    pub description: Option<Option<String>>,
}

/// A recorded change of a variable's value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableChange {
    pub old_value: String,
    pub new_value: String,
}

/// Side-channel "variable changed" notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableNotification {
    pub variable: String,
    pub old_value: String,
    pub new_value: String,
    pub text: String,
}

/// Result of resolving a `$_name` reference
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Text substituted into the render
    pub display: String,
    pub notification: Option<VariableNotification>,
}

impl Resolution {
    pub(crate) fn unchanged(value: String) -> Self {
        Self {
            display: value,
            notification: None,
        }
    }
}
