//! Command handler contract.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::messaging::{ChatMessage, OutboundMessage};
use crate::permission::{PermissionCache, SenderCapabilities};
use crate::template::ResponseEngine;

use super::rollback::RollbackManager;

/// Everything a handler sees for one matched message
#[derive(Clone)]
pub struct Invocation {
    pub dispatch_id: Uuid,
    pub message: Arc<ChatMessage>,
    pub capabilities: SenderCapabilities,
    /// Matched command words, empty for catch-all registrations
    pub command: String,
    /// Text after the matched command
    pub param: String,
    pub engine: Arc<ResponseEngine>,
    pub rollback: Arc<RollbackManager>,
    /// Permission decisions for this dispatch
    pub permissions: Arc<PermissionCache>,
}

impl Invocation {
    pub fn sender_id(&self) -> &str {
        &self.message.sender.id
    }

    /// Reply addressed from the message's sender
    pub fn reply(&self, text: impl Into<String>) -> OutboundMessage {
        OutboundMessage::new(text, self.message.sender.clone())
    }
}

/// Result of a handler run. `allowed == false` vetoes the rest of the
/// dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    pub allowed: bool,
    pub responses: Vec<OutboundMessage>,
}

impl HandlerOutcome {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            responses: Vec::new(),
        }
    }

    pub fn respond(responses: Vec<OutboundMessage>) -> Self {
        Self {
            allowed: true,
            responses,
        }
    }

    pub fn denied(responses: Vec<OutboundMessage>) -> Self {
        Self {
            allowed: false,
            responses,
        }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, invocation: Invocation) -> anyhow::Result<HandlerOutcome>;
}
