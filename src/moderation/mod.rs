//! Moderation collaborator: blocked lines and ignored senders.

use async_trait::async_trait;
use dashmap::DashSet;

use crate::messaging::{ChatMessage, Sender};

#[async_trait]
pub trait Moderation: Send + Sync {
    /// Whether moderation filters stop this line
    async fn is_moderated(&self, message: &ChatMessage) -> bool;

    /// Whether the sender is on the ignore list
    async fn is_ignored(&self, sender: &Sender) -> bool;
}

/// Ignore list plus case-insensitive blocked phrases
#[derive(Default)]
pub struct BasicModeration {
    ignored: DashSet<String>,
    blocked_phrases: DashSet<String>,
}

impl BasicModeration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore(&self, username: &str) {
        self.ignored.insert(username.to_lowercase());
    }

    pub fn unignore(&self, username: &str) -> bool {
        self.ignored.remove(&username.to_lowercase()).is_some()
    }

    pub fn block_phrase(&self, phrase: &str) {
        self.blocked_phrases.insert(phrase.to_lowercase());
    }
}

#[async_trait]
impl Moderation for BasicModeration {
    async fn is_moderated(&self, message: &ChatMessage) -> bool {
        let text = message.text.to_lowercase();
        self.blocked_phrases
            .iter()
            .any(|phrase| text.contains(phrase.as_str()))
    }

    async fn is_ignored(&self, sender: &Sender) -> bool {
        self.ignored.contains(&sender.username.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ignore_list_is_case_insensitive() {
        let moderation = BasicModeration::new();
        moderation.ignore("NightBot");

        assert!(moderation.is_ignored(&Sender::new("1", "nightbot")).await);
        assert!(!moderation.is_ignored(&Sender::new("2", "alice")).await);

        assert!(moderation.unignore("nightbot"));
        assert!(!moderation.is_ignored(&Sender::new("1", "nightbot")).await);
    }

    #[tokio::test]
    async fn test_blocked_phrase() {
        let moderation = BasicModeration::new();
        moderation.block_phrase("buy followers");

        let spam = ChatMessage::new(Sender::new("1", "spammer"), "Buy Followers cheap!");
        let fine = ChatMessage::new(Sender::new("2", "alice"), "hello there");

        assert!(moderation.is_moderated(&spam).await);
        assert!(!moderation.is_moderated(&fine).await);
    }
}
