//! Per-render state shared by every node of one template render.

use std::collections::HashMap;

use serde_json::Value;

use crate::messaging::Sender;
use crate::permission::SenderCapabilities;
use crate::variables::VariableNotification;

#[derive(Debug, Clone)]
pub struct RenderContext {
    pub sender: Sender,
    pub capabilities: SenderCapabilities,
    /// Values for `$name` references
    pub params: HashMap<String, String>,
    /// Mutation operand for `$_name` references
    pub operand: Option<String>,
    /// Filter side products addressable as `(<filter>.<path>)`
    pub by_products: HashMap<String, Value>,
    /// Flags of the chat message being answered
    pub skip: bool,
    pub quiet: bool,
    pub(crate) notifications: Vec<VariableNotification>,
}

impl RenderContext {
    /// Context with `$sender` bound to the sender's username
    pub fn new(sender: Sender, capabilities: SenderCapabilities) -> Self {
        let mut params = HashMap::new();
        params.insert("sender".to_string(), sender.username.clone());

        Self {
            sender,
            capabilities,
            params,
            operand: None,
            by_products: HashMap::new(),
            skip: false,
            quiet: false,
            notifications: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Set the operand. Blank operands count as none.
    pub fn with_operand(mut self, operand: impl Into<String>) -> Self {
        let operand = operand.into();
        self.operand = if operand.trim().is_empty() {
            None
        } else {
            Some(operand)
        };
        self
    }

    pub fn with_flags(mut self, skip: bool, quiet: bool) -> Self {
        self.skip = skip;
        self.quiet = quiet;
        self
    }

    pub fn notifications(&self) -> &[VariableNotification] {
        &self.notifications
    }
}

/// Result of rendering a template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderOutput {
    pub text: String,
    /// "Variable changed" notifications collected during the render
    pub notifications: Vec<VariableNotification>,
}
