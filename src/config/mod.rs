//! Configuration for the proxy.
//!
//! Loaded from a TOML file, with select values overridable via environment
//! variables (`from_env_overrides`). All sections are optional with sensible
//! defaults so a minimal deployment needs only `database_url` and
//! `key_hasher_secret`.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Root configuration (§6 "Configuration (recognized options)").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub plan: PlanConfig,
    #[serde(default)]
    pub bedrock: BedrockConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Build a config purely from the environment (used by tests and
    /// container deployments that don't mount a config file).
    pub fn from_env() -> Self {
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("PLAN_API_KEY") {
            self.plan.api_key = v;
        }
        if let Ok(v) = std::env::var("PLAN_API_URL") {
            self.plan.api_url = v;
        }
        if let Ok(v) = std::env::var("KEY_HASHER_SECRET") {
            self.auth.key_hasher_secret = v;
        }
        if let Ok(v) = std::env::var("KMS_KEY_ID") {
            self.bedrock.kms_key_id = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.observability.log_level = v;
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            plan: PlanConfig::default(),
            bedrock: BedrockConfig::default(),
            usage: UsageConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    "sqlite://keyforward.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

/// C1 Authenticator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Secret salt mixed into the HMAC fingerprint of raw access keys (§4.1).
    #[serde(default)]
    pub key_hasher_secret: String,
    /// TTL, in seconds, for both positive and negative auth cache entries.
    #[serde(default = "default_access_key_cache_ttl")]
    pub access_key_cache_ttl_secs: u64,
}

fn default_access_key_cache_ttl() -> u64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_hasher_secret: String::new(),
            access_key_cache_ttl_secs: default_access_key_cache_ttl(),
        }
    }
}

/// C2 Circuit breaker configuration (§4.2 parameters F, W, R).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_failure_window_secs() -> u64 {
    60
}
fn default_reset_timeout_secs() -> u64 {
    1800
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

/// C4 Plan adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
    #[serde(default = "default_plan_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_plan_api_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_read_timeout() -> u64 {
    300
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            api_url: default_plan_api_url(),
            api_key: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

/// C5 Bedrock adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BedrockConfig {
    #[serde(default = "default_bedrock_region")]
    pub default_region: String,
    #[serde(default = "default_bedrock_model")]
    pub default_model: String,
    #[serde(default)]
    pub kms_key_id: String,
    /// TTL, in seconds, for the decrypted-credential cache (C9).
    #[serde(default = "default_bedrock_key_cache_ttl")]
    pub key_cache_ttl_secs: u64,
    /// Input event-stream buffer cap, in bytes, before the stream is aborted (§4.5, §4.7 backpressure).
    #[serde(default = "default_max_input_buffer_bytes")]
    pub max_input_buffer_bytes: usize,
    /// Output SSE chunk queue cap before the stream is aborted as a slow-consumer guard.
    #[serde(default = "default_max_output_buffer_chunks")]
    pub max_output_buffer_chunks: usize,
}

fn default_max_input_buffer_bytes() -> usize {
    1024 * 1024
}
fn default_max_output_buffer_chunks() -> usize {
    4096
}

fn default_bedrock_region() -> String {
    "us-east-1".to_string()
}
fn default_bedrock_model() -> String {
    "anthropic.claude-3-5-sonnet-20241022-v2:0".to_string()
}
fn default_bedrock_key_cache_ttl() -> u64 {
    300
}

impl Default for BedrockConfig {
    fn default() -> Self {
        Self {
            default_region: default_bedrock_region(),
            default_model: default_bedrock_model(),
            kms_key_id: String::new(),
            key_cache_ttl_secs: default_bedrock_key_cache_ttl(),
            max_input_buffer_bytes: default_max_input_buffer_bytes(),
            max_output_buffer_chunks: default_max_output_buffer_chunks(),
        }
    }
}

/// C8 Usage recorder configuration — bucket-truncation week start (§4.8, §9 Open Question 1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageConfig {
    #[serde(default)]
    pub week_start: WeekStart,
    #[serde(default = "default_week_start_tz")]
    pub week_start_tz_offset_hours: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekStart {
    #[default]
    Monday,
    Sunday,
}

fn default_week_start_tz() -> i32 {
    0
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            week_start: WeekStart::default(),
            week_start_tz_offset_hours: default_week_start_tz(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}
