//! Command registry.
//!
//! Populated at startup through `&mut self`, then shared read-only behind an
//! `Arc` for the lifetime of the process.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::permission::PermissionTier;

use super::handler::CommandHandler;

/// Dispatch tiers, run highest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

impl Priority {
    /// Tiers in dispatch order
    pub const DESCENDING: [Priority; 4] = [
        Priority::Highest,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Highest => "highest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The dispatcher waits for the handler; its result can veto the rest
    #[default]
    Awaited,
    /// Spawned on the detached queue; failures are only logged
    FireAndForget,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandPattern {
    /// Lower-cased command words, e.g. `["!points", "give"]`
    Command(Vec<String>),
    /// Runs for every line
    Any,
}

impl CommandPattern {
    pub fn command(text: &str) -> Self {
        Self::Command(tokenize(text))
    }

    fn words(&self) -> Option<&[String]> {
        match self {
            Self::Command(words) if !words.is_empty() => Some(words),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(words) => f.write_str(&words.join(" ")),
            Self::Any => f.write_str("*"),
        }
    }
}

pub struct CommandRegistration {
    pub id: Uuid,
    pub name: String,
    pub pattern: CommandPattern,
    pub priority: Priority,
    pub permission: PermissionTier,
    pub mode: ExecutionMode,
    /// May be bypassed by a privileged sender's `skip` flag
    pub skippable: bool,
    pub handler: Arc<dyn CommandHandler>,
}

impl CommandRegistration {
    pub fn new(
        name: impl Into<String>,
        pattern: CommandPattern,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            pattern,
            priority: Priority::default(),
            permission: PermissionTier::default(),
            mode: ExecutionMode::default(),
            skippable: false,
            handler,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn permission(mut self, permission: PermissionTier) -> Self {
        self.permission = permission;
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.mode = ExecutionMode::FireAndForget;
        self
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }
}

impl std::fmt::Debug for CommandRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("priority", &self.priority)
            .field("permission", &self.permission)
            .field("mode", &self.mode)
            .field("skippable", &self.skippable)
            .finish_non_exhaustive()
    }
}

/// One handler to run for a message
#[derive(Debug, Clone)]
pub struct PlannedInvocation {
    pub registration: Arc<CommandRegistration>,
    /// Matched command words, empty for catch-all registrations
    pub command: String,
    pub param: String,
}

#[derive(Default)]
pub struct CommandRegistry {
    registrations: Vec<Arc<CommandRegistration>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns the registration id.
    pub fn register(&mut self, registration: CommandRegistration) -> Uuid {
        let id = registration.id;
        tracing::info!(
            id = %id,
            name = %registration.name,
            pattern = %registration.pattern,
            priority = registration.priority.as_str(),
            mode = ?registration.mode,
            "Command registered"
        );
        self.registrations.push(Arc::new(registration));
        id
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<CommandRegistration>> {
        self.registrations.iter().find(|r| r.id == id).cloned()
    }

    /// Plan the handlers for a line.
    ///
    /// Within each tier, highest first, the longest registered command prefix
    /// of the line wins and every registration for it runs in registration
    /// order, followed by the tier's catch-all registrations.
    pub fn resolve(&self, text: &str) -> Vec<PlannedInvocation> {
        let original: Vec<&str> = text.split_whitespace().collect();
        let tokens = tokenize(text);
        let mut plan = Vec::new();

        for tier in Priority::DESCENDING {
            let in_tier = || self.registrations.iter().filter(move |r| r.priority == tier);

            let matched_len = in_tier()
                .filter_map(|r| r.pattern.words())
                .filter(|words| is_prefix(words, &tokens))
                .map(|words| words.len())
                .max();

            if let Some(len) = matched_len {
                let command = tokens[..len].join(" ");
                let param = original[len..].join(" ");

                plan.extend(
                    in_tier()
                        .filter(|r| r.pattern.words().is_some_and(|w| w.len() == len && is_prefix(w, &tokens)))
                        .map(|r| PlannedInvocation {
                            registration: r.clone(),
                            command: command.clone(),
                            param: param.clone(),
                        }),
                );
            }

            plan.extend(
                in_tier()
                    .filter(|r| r.pattern == CommandPattern::Any)
                    .map(|r| PlannedInvocation {
                        registration: r.clone(),
                        command: String::new(),
                        param: original.join(" "),
                    }),
            );
        }

        plan
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

fn is_prefix(words: &[String], tokens: &[String]) -> bool {
    words.len() <= tokens.len() && words.iter().zip(tokens).all(|(w, t)| w == t)
}
