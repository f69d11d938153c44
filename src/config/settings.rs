use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub variables: VariableStoreConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to every `api` filter fetch, in milliseconds
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
    /// User agent sent by the `api` filter
    #[serde(default = "default_api_user_agent")]
    pub api_user_agent: String,
    /// Filter nesting depth past which nodes render as their source text
    #[serde(default = "default_max_render_depth")]
    pub max_render_depth: usize,
    /// Text rendered by `random.*` user draws when the pool is empty
    #[serde(default = "default_unknown_user")]
    pub unknown_user: String,
}

fn default_api_timeout_ms() -> u64 {
    5000 // 5 seconds
}

fn default_api_user_agent() -> String {
    "ara-chat-engine".to_string()
}

fn default_max_render_depth() -> usize {
    32
}

fn default_unknown_user() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariableStoreConfig {
    /// Storage backend: "memory" or "redis"
    #[serde(default = "default_variable_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    /// How long prior values stay in a variable's history
    #[serde(default = "default_history_retention")]
    pub history_retention_seconds: u64,
    /// Maximum history entries kept per variable
    #[serde(default = "default_history_max_entries")]
    pub history_max_entries: usize,
    /// Notification text for variables announcing their changes
    #[serde(default = "default_notification")]
    pub default_notification: String,
}

fn default_variable_backend() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_prefix() -> String {
    "ara:chat".to_string()
}

fn default_history_retention() -> u64 {
    86400 // 24 hours
}

fn default_history_max_entries() -> usize {
    50
}

fn default_notification() -> String {
    "{{sender}}, {{variable}} was set to {{value}}.".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermissionsConfig {
    /// Usernames that always resolve to the caster tier
    #[serde(default)]
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Export spans through OTLP
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Trace sampling ratio (0.0-1.0)
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
    /// Console log format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-chat-engine".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("engine.api_timeout_ms", 5000)?
            .set_default("engine.max_render_depth", 32)?
            .set_default("variables.backend", "memory")?
            .set_default("variables.history_retention_seconds", 86400)?
            .set_default("telemetry.enabled", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // ENGINE__API_TIMEOUT_MS, VARIABLES__BACKEND, PERMISSIONS__OWNERS, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("permissions.owners"),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_timeout_ms: default_api_timeout_ms(),
            api_user_agent: default_api_user_agent(),
            max_render_depth: default_max_render_depth(),
            unknown_user: default_unknown_user(),
        }
    }
}

impl Default for VariableStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_variable_backend(),
            redis_url: default_redis_url(),
            redis_prefix: default_redis_prefix(),
            history_retention_seconds: default_history_retention(),
            history_max_entries: default_history_max_entries(),
            default_notification: default_notification(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
            log_format: default_log_format(),
        }
    }
}
