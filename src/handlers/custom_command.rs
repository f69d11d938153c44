//! Custom commands: admin-defined commands whose responses are templates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::dispatch::{
    CommandHandler, CommandPattern, CommandRegistration, HandlerOutcome, Invocation, Priority,
};
use crate::locale::Translator;
use crate::messaging::OutboundMessage;
use crate::permission::PermissionTier;
use crate::template::RenderContext;

lazy_static! {
    static ref COMMAND_NAME: Regex = Regex::new(r"^!?[\p{L}\p{N}_-]+( [\p{L}\p{N}_-]+)*$").unwrap();
}

#[derive(Debug, Error, PartialEq)]
pub enum CustomCommandError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Command already exists: {0}")]
    AlreadyExists(String),

    #[error("Command not found: {0}")]
    NotFound(String),

    #[error("Response {index} out of range for {command}")]
    ResponseIndex { command: String, index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomResponse {
    /// Response template
    pub text: String,
    #[serde(default)]
    pub permission: PermissionTier,
    /// Stop after this response when it was sent
    #[serde(default)]
    pub stop_if_executed: bool,
}

impl CustomResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            permission: PermissionTier::Viewer,
            stop_if_executed: false,
        }
    }

    pub fn permission(mut self, permission: PermissionTier) -> Self {
        self.permission = permission;
        self
    }

    pub fn stop_if_executed(mut self) -> Self {
        self.stop_if_executed = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomCommand {
    pub id: Uuid,
    /// Lower-cased, single-spaced command words
    pub command: String,
    pub enabled: bool,
    pub responses: Vec<CustomResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct CustomCommands {
    commands: DashMap<String, CustomCommand>,
    translator: Arc<dyn Translator>,
}

impl CustomCommands {
    pub fn new(translator: Arc<dyn Translator>) -> Self {
        Self {
            commands: DashMap::new(),
            translator,
        }
    }

    /// Registration for the handler: every line, normal tier
    pub fn registration(self: &Arc<Self>) -> CommandRegistration {
        CommandRegistration::new("customcommands", CommandPattern::Any, self.clone())
            .priority(Priority::Normal)
    }

    pub fn create(
        &self,
        command: &str,
        responses: Vec<CustomResponse>,
    ) -> Result<CustomCommand, CustomCommandError> {
        let key = validate_command(command)?;
        let now = Utc::now();

        match self.commands.entry(key.clone()) {
            Entry::Occupied(_) => Err(CustomCommandError::AlreadyExists(key)),
            Entry::Vacant(slot) => {
                let created = CustomCommand {
                    id: Uuid::new_v4(),
                    command: key,
                    enabled: true,
                    responses,
                    created_at: now,
                    updated_at: now,
                };
                slot.insert(created.clone());

                tracing::info!(command = %created.command, "Custom command created");
                Ok(created)
            }
        }
    }

    pub fn get(&self, command: &str) -> Option<CustomCommand> {
        self.commands.get(&normalize(command)).map(|c| c.value().clone())
    }

    /// All commands, sorted by name
    pub fn list(&self) -> Vec<CustomCommand> {
        let mut commands: Vec<CustomCommand> =
            self.commands.iter().map(|c| c.value().clone()).collect();
        commands.sort_by(|a, b| a.command.cmp(&b.command));
        commands
    }

    pub fn delete(&self, command: &str) -> Result<CustomCommand, CustomCommandError> {
        let key = normalize(command);
        let (_, removed) = self
            .commands
            .remove(&key)
            .ok_or(CustomCommandError::NotFound(key))?;

        tracing::info!(command = %removed.command, "Custom command deleted");
        Ok(removed)
    }

    pub fn set_enabled(&self, command: &str, enabled: bool) -> Result<(), CustomCommandError> {
        self.modify(command, |c| {
            c.enabled = enabled;
            Ok(())
        })
    }

    pub fn add_response(
        &self,
        command: &str,
        response: CustomResponse,
    ) -> Result<(), CustomCommandError> {
        self.modify(command, |c| {
            c.responses.push(response);
            Ok(())
        })
    }

    pub fn update_response(
        &self,
        command: &str,
        index: usize,
        response: CustomResponse,
    ) -> Result<(), CustomCommandError> {
        self.modify(command, |c| match c.responses.get_mut(index) {
            Some(slot) => {
                *slot = response;
                Ok(())
            }
            None => Err(CustomCommandError::ResponseIndex {
                command: c.command.clone(),
                index,
            }),
        })
    }

    pub fn remove_response(
        &self,
        command: &str,
        index: usize,
    ) -> Result<CustomResponse, CustomCommandError> {
        let mut removed = None;
        self.modify(command, |c| {
            if index >= c.responses.len() {
                return Err(CustomCommandError::ResponseIndex {
                    command: c.command.clone(),
                    index,
                });
            }
            removed = Some(c.responses.remove(index));
            Ok(())
        })?;

        removed.ok_or_else(|| CustomCommandError::NotFound(normalize(command)))
    }

    fn modify<F>(&self, command: &str, f: F) -> Result<(), CustomCommandError>
    where
        F: FnOnce(&mut CustomCommand) -> Result<(), CustomCommandError>,
    {
        let key = normalize(command);
        let mut entry = self
            .commands
            .get_mut(&key)
            .ok_or_else(|| CustomCommandError::NotFound(key.clone()))?;

        f(entry.value_mut())?;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Longest enabled command that prefixes the line, with the remaining
    /// parameter
    fn find(&self, line: &str) -> Option<(CustomCommand, String)> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let lowered: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();

        (1..=words.len()).rev().find_map(|len| {
            let command = self.commands.get(&lowered[..len].join(" "))?;
            if !command.enabled {
                return None;
            }
            Some((command.value().clone(), words[len..].join(" ")))
        })
    }
}

#[async_trait]
impl CommandHandler for CustomCommands {
    async fn handle(&self, invocation: Invocation) -> anyhow::Result<HandlerOutcome> {
        let Some((command, param)) = self.find(&invocation.param) else {
            return Ok(HandlerOutcome::allowed());
        };

        let sender = &invocation.message.sender;

        if command.responses.is_empty() {
            let mut params = Map::new();
            params.insert("sender".to_string(), Value::String(sender.username.clone()));
            params.insert("command".to_string(), Value::String(command.command.clone()));
            let text = self.translator.localize("customcmds.no-response", &params);
            return Ok(HandlerOutcome::respond(vec![invocation.reply(text)]));
        }

        let touser = param
            .split_whitespace()
            .next()
            .map(|word| word.trim_start_matches('@').to_string())
            .filter(|word| !word.is_empty())
            .unwrap_or_else(|| sender.username.clone());

        let mut responses = Vec::new();

        for response in &command.responses {
            if !invocation
                .permissions
                .check(invocation.sender_id(), response.permission)
                .await
            {
                continue;
            }

            let mut ctx = RenderContext::new(sender.clone(), invocation.capabilities.clone())
                .with_param("param", param.clone())
                .with_param("touser", touser.clone())
                .with_operand(param.clone())
                .with_flags(invocation.message.skip, invocation.message.quiet);

            let output = invocation.engine.render_template(&response.text, &mut ctx).await;

            if !output.text.trim().is_empty() {
                responses.push(invocation.reply(output.text));
            }
            responses.extend(output.notifications.into_iter().map(|n| {
                OutboundMessage::new(n.text, sender.clone())
                    .with_attr("kind", "notification")
                    .with_attr("variable", n.variable)
            }));

            if response.stop_if_executed {
                break;
            }
        }

        tracing::debug!(
            dispatch_id = %invocation.dispatch_id,
            command = %command.command,
            responses = responses.len(),
            "Custom command executed"
        );

        Ok(HandlerOutcome::respond(responses))
    }
}

fn normalize(command: &str) -> String {
    command
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command(command: &str) -> Result<String, CustomCommandError> {
    let key = normalize(command);
    if COMMAND_NAME.is_match(&key) {
        Ok(key)
    } else {
        Err(CustomCommandError::InvalidCommand(command.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locale::StaticTranslator;

    fn commands() -> CustomCommands {
        CustomCommands::new(Arc::new(StaticTranslator::new()))
    }

    #[test]
    fn test_crud() {
        let cmds = commands();
        let created = cmds
            .create("!Hug", vec![CustomResponse::new("$sender hugs $touser")])
            .unwrap();
        assert_eq!(created.command, "!hug");

        assert_eq!(
            cmds.create("!hug", vec![]).unwrap_err(),
            CustomCommandError::AlreadyExists("!hug".to_string())
        );

        cmds.add_response("!hug", CustomResponse::new("again").stop_if_executed())
            .unwrap();
        cmds.update_response("!HUG", 0, CustomResponse::new("changed"))
            .unwrap();
        assert_eq!(cmds.get("!hug").unwrap().responses[0].text, "changed");

        assert!(matches!(
            cmds.remove_response("!hug", 5),
            Err(CustomCommandError::ResponseIndex { index: 5, .. })
        ));
        assert_eq!(cmds.remove_response("!hug", 1).unwrap().text, "again");

        cmds.create("!a", vec![]).unwrap();
        let names: Vec<String> = cmds.list().into_iter().map(|c| c.command).collect();
        assert_eq!(names, vec!["!a", "!hug"]);

        cmds.delete("!hug").unwrap();
        assert!(cmds.get("!hug").is_none());
        assert!(matches!(cmds.delete("!hug"), Err(CustomCommandError::NotFound(_))));
    }

    #[test]
    fn test_invalid_names() {
        let cmds = commands();
        assert!(matches!(cmds.create("", vec![]), Err(CustomCommandError::InvalidCommand(_))));
        assert!(matches!(cmds.create("!a(b)", vec![]), Err(CustomCommandError::InvalidCommand(_))));
        assert!(cmds.create("!points   give", vec![]).is_ok());
        assert!(cmds.get("!POINTS give").is_some());
    }

    #[test]
    fn test_find_longest_enabled() {
        let cmds = commands();
        cmds.create("!a", vec![]).unwrap();
        cmds.create("!a b", vec![]).unwrap();

        let (cmd, param) = cmds.find("!A B c d").unwrap();
        assert_eq!(cmd.command, "!a b");
        assert_eq!(param, "c d");

        cmds.set_enabled("!a b", false).unwrap();
        let (cmd, param) = cmds.find("!a b c").unwrap();
        assert_eq!(cmd.command, "!a");
        assert_eq!(param, "b c");

        assert!(cmds.find("!ab").is_none());
    }
}
