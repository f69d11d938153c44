//! Translation collaborator.
//!
//! Handlers localize their literal response text before handing it to the
//! template engine. Entries use `{{param}}` placeholders.

use std::collections::HashMap;

use serde_json::{Map, Value};

pub trait Translator: Send + Sync {
    fn localize(&self, key: &str, params: &Map<String, Value>) -> String;
}

/// Key → text table with built-in English defaults
pub struct StaticTranslator {
    entries: HashMap<String, String>,
}

impl Default for StaticTranslator {
    fn default() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            "price.user-have-not-enough-points".to_string(),
            "Sorry, {{sender}}, but you don't have {{amount}} points to use {{command}}".to_string(),
        );
        entries.insert(
            "core.permission-denied".to_string(),
            "{{sender}}, you don't have permission to use {{command}}".to_string(),
        );
        entries.insert(
            "customcmds.no-response".to_string(),
            "{{sender}}, {{command}} has no responses".to_string(),
        );
        Self { entries }
    }
}

impl StaticTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.entries.insert(key.into(), text.into());
        self
    }
}

impl Translator for StaticTranslator {
    fn localize(&self, key: &str, params: &Map<String, Value>) -> String {
        match self.entries.get(key) {
            Some(text) => substitute_placeholders(text, params),
            None => {
                tracing::debug!(key = %key, "Missing translation");
                key.to_string()
            }
        }
    }
}

/// Render a JSON value as placeholder text
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "".to_string(),
        // For arrays and objects, use JSON representation
        _ => value.to_string(),
    }
}

/// Replace every `{{key}}` placeholder with its value
pub fn substitute_placeholders(template: &str, variables: &Map<String, Value>) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let pattern = format!("{{{{{}}}}}", key);
        result = result.replace(&pattern, &value_to_text(value));
    }

    result
}
