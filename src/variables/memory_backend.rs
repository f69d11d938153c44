//! In-memory variable backend using DashMap.
//!
//! Values are lost on restart. Writes hold the entry's shard lock, which makes
//! `set_value` and `atomic_increment` atomic per variable.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::backend::{VariableBackend, VariableBackendError};
use super::types::{format_number, parse_number, CustomVariable};

#[derive(Default)]
pub struct MemoryVariableBackend {
    variables: DashMap<String, CustomVariable>,
}

impl MemoryVariableBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VariableBackend for MemoryVariableBackend {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, name: &str) -> Result<Option<CustomVariable>, VariableBackendError> {
        Ok(self.variables.get(name).map(|v| v.clone()))
    }

    async fn list(&self) -> Result<Vec<CustomVariable>, VariableBackendError> {
        let mut variables: Vec<CustomVariable> = self
            .variables
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        variables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(variables)
    }

    async fn insert(&self, variable: CustomVariable) -> Result<bool, VariableBackendError> {
        match self.variables.entry(variable.name.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(variable);
                Ok(true)
            }
        }
    }

    async fn replace(&self, variable: CustomVariable) -> Result<bool, VariableBackendError> {
        match self.variables.get_mut(&variable.name) {
            Some(mut existing) => {
                *existing = variable;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool, VariableBackendError> {
        Ok(self.variables.remove(name).is_some())
    }

    async fn set_value(
        &self,
        name: &str,
        value: &str,
    ) -> Result<Option<String>, VariableBackendError> {
        Ok(self.variables.get_mut(name).map(|mut variable| {
            variable.updated_at = Utc::now();
            std::mem::replace(&mut variable.current_value, value.to_string())
        }))
    }

    async fn atomic_increment(
        &self,
        name: &str,
        delta: f64,
    ) -> Result<Option<f64>, VariableBackendError> {
        let Some(mut variable) = self.variables.get_mut(name) else {
            return Ok(None);
        };

        let current = parse_number(&variable.current_value)
            .ok_or_else(|| VariableBackendError::NotNumeric(variable.current_value.clone()))?;
        let next = current + delta;
        if !next.is_finite() {
            return Err(VariableBackendError::NotNumeric(format!(
                "{} + {}",
                variable.current_value, delta
            )));
        }

        variable.current_value = format_number(next);
        variable.updated_at = Utc::now();
        Ok(Some(next))
    }
}
