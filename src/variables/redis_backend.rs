//! Redis-based variable backend.
//!
//! Key structure:
//! - `{prefix}:variable:{name}` - Hash with `definition` (JSON) and `value`
//! - `{prefix}:variables` - Set of every variable name
//!
//! The value lives in its own hash field so increments can use
//! `HINCRBYFLOAT`. Every multi-step write runs as a Lua script, which keeps
//! existence checks and writes atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::RwLock;

use super::backend::{VariableBackend, VariableBackendError};
use super::types::{parse_number, CustomVariable};

const INSERT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'definition', ARGV[1], 'value', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
return 1
"#;

const REPLACE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'definition', ARGV[1], 'value', ARGV[2])
return 1
"#;

const SET_VALUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
local previous = redis.call('HGET', KEYS[1], 'value')
redis.call('HSET', KEYS[1], 'value', ARGV[1])
return previous
"#;

const INCREMENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
return redis.call('HINCRBYFLOAT', KEYS[1], 'value', ARGV[1])
"#;

pub struct RedisVariableBackend {
    /// Redis client for creating connections
    client: Client,

    /// Multiplexed connection (shared across tasks)
    connection: RwLock<Option<MultiplexedConnection>>,

    /// Key prefix for Redis keys
    prefix: String,

    insert_script: Script,
    replace_script: Script,
    set_value_script: Script,
    increment_script: Script,
}

impl RedisVariableBackend {
    /// Create a backend. The connection is established on first use.
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, VariableBackendError> {
        let client = Client::open(url)?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            prefix: prefix.into(),
            insert_script: Script::new(INSERT_SCRIPT),
            replace_script: Script::new(REPLACE_SCRIPT),
            set_value_script: Script::new(SET_VALUE_SCRIPT),
            increment_script: Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Generate the Redis key for a variable.
    fn variable_key(&self, name: &str) -> String {
        format!("{}:variable:{}", self.prefix, name)
    }

    /// Generate the Redis key for the name index.
    fn index_key(&self) -> String {
        format!("{}:variables", self.prefix)
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection, VariableBackendError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        let mut conn_guard = self.connection.write().await;

        // Double-check in case another task connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                tracing::info!("Redis variable backend connection established");
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(VariableBackendError::Redis(e))
            }
        }
    }

    fn decode(fields: HashMap<String, String>) -> Result<Option<CustomVariable>, VariableBackendError> {
        let Some(definition) = fields.get("definition") else {
            return Ok(None);
        };

        let mut variable: CustomVariable = serde_json::from_str(definition)?;
        if let Some(value) = fields.get("value") {
            variable.current_value = value.clone();
        }

        Ok(Some(variable))
    }
}

#[async_trait]
impl VariableBackend for RedisVariableBackend {
    fn backend_type(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, name: &str) -> Result<Option<CustomVariable>, VariableBackendError> {
        let mut conn = self.get_connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.variable_key(name)).await?;
        Self::decode(fields)
    }

    async fn list(&self) -> Result<Vec<CustomVariable>, VariableBackendError> {
        let mut conn = self.get_connection().await?;
        let mut names: Vec<String> = conn.smembers(self.index_key()).await?;
        names.sort();

        let mut variables = Vec::with_capacity(names.len());
        for name in names {
            let fields: HashMap<String, String> = conn.hgetall(self.variable_key(&name)).await?;
            if let Some(variable) = Self::decode(fields)? {
                variables.push(variable);
            }
        }

        Ok(variables)
    }

    async fn insert(&self, variable: CustomVariable) -> Result<bool, VariableBackendError> {
        let mut conn = self.get_connection().await?;
        let definition = serde_json::to_string(&variable)?;

        let inserted: i64 = self
            .insert_script
            .key(self.variable_key(&variable.name))
            .key(self.index_key())
            .arg(definition)
            .arg(&variable.current_value)
            .arg(&variable.name)
            .invoke_async(&mut conn)
            .await?;

        Ok(inserted == 1)
    }

    async fn replace(&self, variable: CustomVariable) -> Result<bool, VariableBackendError> {
        let mut conn = self.get_connection().await?;
        let definition = serde_json::to_string(&variable)?;

        let replaced: i64 = self
            .replace_script
            .key(self.variable_key(&variable.name))
            .arg(definition)
            .arg(&variable.current_value)
            .invoke_async(&mut conn)
            .await?;

        Ok(replaced == 1)
    }

    async fn delete(&self, name: &str) -> Result<bool, VariableBackendError> {
        let mut conn = self.get_connection().await?;

        let (deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .del(self.variable_key(name))
            .srem(self.index_key(), name)
            .query_async(&mut conn)
            .await?;

        Ok(deleted > 0)
    }

    async fn set_value(
        &self,
        name: &str,
        value: &str,
    ) -> Result<Option<String>, VariableBackendError> {
        let mut conn = self.get_connection().await?;

        let previous: Option<String> = self
            .set_value_script
            .key(self.variable_key(name))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;

        Ok(previous)
    }

    async fn atomic_increment(
        &self,
        name: &str,
        delta: f64,
    ) -> Result<Option<f64>, VariableBackendError> {
        let mut conn = self.get_connection().await?;

        let next: Option<String> = self
            .increment_script
            .key(self.variable_key(name))
            .arg(delta)
            .invoke_async(&mut conn)
            .await?;

        match next {
            Some(text) => parse_number(&text).map(Some).ok_or_else(|| {
                VariableBackendError::NotNumeric(text)
            }),
            None => Ok(None),
        }
    }
}
