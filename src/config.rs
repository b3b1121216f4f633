//! Agent configuration: defaults, environment loading and validation.
//!
//! Configuration is frozen once a handler is constructed from it; the
//! handler registry rejects conflicting re-configurations.

use std::collections::HashSet;
use std::env;

use serde::{Deserialize, Serialize};

/// Errors raised while building or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the guard agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// API key used for backend authentication and payload key derivation.
    pub api_key: String,
    /// Project identifier; part of the wire envelope and the derived key.
    pub project_id: String,
    /// Base URL of the management backend.
    pub endpoint: String,
    /// Capacity of each in-memory queue (events and metrics).
    pub buffer_size: usize,
    /// Seconds between timed flushes.
    pub flush_interval: u64,
    /// Whether security events are collected.
    pub enable_events: bool,
    /// Whether performance metrics are collected.
    pub enable_metrics: bool,
    /// Number of retries after the initial attempt.
    pub retry_attempts: u32,
    /// Base factor for exponential backoff between attempts.
    pub backoff_factor: f64,
    /// Per-attempt HTTP timeout in seconds.
    pub timeout: u64,
    /// Header names (case-insensitive) redacted from event metadata.
    pub sensitive_headers: HashSet<String>,
    /// Maximum size of a single payload string field, in bytes.
    pub max_payload_size: usize,
    /// Seconds between dynamic-rule polls.
    pub rule_poll_interval: u64,
    /// Namespace prefix for durable-store keys.
    pub key_prefix: String,
    /// Log level used by [`crate::logger::init_logging`].
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            api_key: String::new(),
            project_id: String::new(),
            endpoint: "https://api.fastapi-guard.com".to_string(),
            buffer_size: 100,
            flush_interval: 30,
            enable_events: true,
            enable_metrics: true,
            retry_attempts: 3,
            backoff_factor: 1.0,
            timeout: 30,
            sensitive_headers: default_sensitive_headers(),
            max_payload_size: 1024,
            rule_poll_interval: 300,
            key_prefix: String::new(),
            log_level: "info".to_string(),
        }
    }
}

fn default_sensitive_headers() -> HashSet<String> {
    ["authorization", "cookie", "x-api-key"]
        .iter()
        .map(|h| (*h).to_string())
        .collect()
}

impl AgentConfig {
    /// Creates a configuration from environment variables.
    ///
    /// Recognised variables: `GUARD_AGENT_API_KEY`, `GUARD_AGENT_PROJECT_ID`,
    /// `GUARD_AGENT_ENDPOINT`, `GUARD_AGENT_BUFFER_SIZE`,
    /// `GUARD_AGENT_FLUSH_INTERVAL`, `GUARD_AGENT_ENABLE_EVENTS`,
    /// `GUARD_AGENT_ENABLE_METRICS`, `GUARD_AGENT_RETRY_ATTEMPTS`,
    /// `GUARD_AGENT_BACKOFF_FACTOR`, `GUARD_AGENT_TIMEOUT`,
    /// `GUARD_AGENT_RULE_POLL_INTERVAL`, `GUARD_AGENT_KEY_PREFIX`,
    /// `GUARD_AGENT_LOG_LEVEL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = AgentConfig::default();

        let config = AgentConfig {
            api_key: env::var("GUARD_AGENT_API_KEY").unwrap_or_default(),
            project_id: env::var("GUARD_AGENT_PROJECT_ID").unwrap_or_default(),
            endpoint: env::var("GUARD_AGENT_ENDPOINT").unwrap_or(defaults.endpoint),
            buffer_size: parse_env("GUARD_AGENT_BUFFER_SIZE", defaults.buffer_size),
            flush_interval: parse_env("GUARD_AGENT_FLUSH_INTERVAL", defaults.flush_interval),
            enable_events: parse_env_bool("GUARD_AGENT_ENABLE_EVENTS", defaults.enable_events),
            enable_metrics: parse_env_bool("GUARD_AGENT_ENABLE_METRICS", defaults.enable_metrics),
            retry_attempts: parse_env("GUARD_AGENT_RETRY_ATTEMPTS", defaults.retry_attempts),
            backoff_factor: parse_env("GUARD_AGENT_BACKOFF_FACTOR", defaults.backoff_factor),
            timeout: parse_env("GUARD_AGENT_TIMEOUT", defaults.timeout),
            sensitive_headers: defaults.sensitive_headers,
            max_payload_size: parse_env("GUARD_AGENT_MAX_PAYLOAD_SIZE", defaults.max_payload_size),
            rule_poll_interval: parse_env(
                "GUARD_AGENT_RULE_POLL_INTERVAL",
                defaults.rule_poll_interval,
            ),
            key_prefix: env::var("GUARD_AGENT_KEY_PREFIX").unwrap_or_default(),
            log_level: env::var("GUARD_AGENT_LOG_LEVEL")
                .map(|v| v.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.len() < 10 {
            return Err(ConfigError::Invalid(
                "api_key must be at least 10 characters long".to_string(),
            ));
        }
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Invalid("project_id cannot be empty".to_string()));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ConfigError::Invalid(
                "endpoint must be a valid HTTP/HTTPS URL".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval must be greater than 0".to_string(),
            ));
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid("timeout must be greater than 0".to_string()));
        }
        if self.backoff_factor <= 0.0 {
            return Err(ConfigError::Invalid(
                "backoff_factor must be greater than 0".to_string(),
            ));
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log level '{}'; must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Base URL with any trailing slash removed.
    pub(crate) fn base_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    /// Durable-store key under the agent namespace.
    pub(crate) fn store_key(&self, suffix: &str) -> String {
        format!("{}agent:{}", self.key_prefix, suffix)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.to_lowercase() != "false")
        .unwrap_or(default)
}
