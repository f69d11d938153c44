//! Inbound chat lines and the outbound payload handed to the transport.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// The author of a chat line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub username: String,
}

impl Sender {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// One incoming chat line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
    /// Bypass skippable gates (honoured for casters and moderators only)
    #[serde(default)]
    pub skip: bool,
    /// Run handlers without delivering their responses
    #[serde(default)]
    pub quiet: bool,
    pub received_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
            skip: false,
            quiet: false,
            received_at: Utc::now(),
        }
    }

    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// Payload accepted by the messaging transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attrs: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(text: impl Into<String>, sender: Sender) -> Self {
        Self {
            text: text.into(),
            sender,
            attrs: HashMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// Messaging transport collaborator
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: OutboundMessage);
}

/// Sink that keeps every delivered message in memory
#[derive(Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .map(|message| message.text.clone())
            .collect()
    }

    pub async fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.messages.lock().await)
    }
}

#[async_trait]
impl MessageSink for CollectingSink {
    async fn deliver(&self, message: OutboundMessage) {
        self.messages.lock().await.push(message);
    }
}
