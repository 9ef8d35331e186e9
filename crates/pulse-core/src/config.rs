//! Process configuration from the environment.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("{name} is not a valid {expected}: {value}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Everything the process needs from the environment.
#[derive(Debug, Clone)]
pub struct PulseConfig {
    pub database_url: String,
    /// Process-level key the credential keyring derives from.
    pub signing_key: String,
    pub vector_gateway_url: String,
    pub vector_gateway_fallback_url: Option<String>,
    pub vector_gateway_api_key: Option<String>,
    /// Default orchestrator wake interval, overridable per tenant.
    pub orchestrator_interval_minutes: i64,
    pub retry_interval_minutes: i64,
    pub max_retry_attempts: i32,
    /// Per-message handler timeouts, seconds.
    pub extract_timeout_secs: u64,
    pub transform_timeout_secs: u64,
    pub embed_timeout_secs: u64,
}

impl PulseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require("DATABASE_URL")?,
            signing_key: require("PULSE_SIGNING_KEY")?,
            vector_gateway_url: require("VECTOR_GATEWAY_URL")?,
            vector_gateway_fallback_url: optional("VECTOR_GATEWAY_FALLBACK_URL"),
            vector_gateway_api_key: optional("VECTOR_GATEWAY_API_KEY"),
            orchestrator_interval_minutes: parsed("PULSE_ORCHESTRATOR_INTERVAL_MINUTES", 1)?,
            retry_interval_minutes: parsed("PULSE_RETRY_INTERVAL_MINUTES", 15)?,
            max_retry_attempts: parsed("PULSE_MAX_RETRY_ATTEMPTS", 5)?,
            extract_timeout_secs: parsed("PULSE_EXTRACT_TIMEOUT_SECS", 300)?,
            transform_timeout_secs: parsed("PULSE_TRANSFORM_TIMEOUT_SECS", 120)?,
            embed_timeout_secs: parsed("PULSE_EMBED_TIMEOUT_SECS", 60)?,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            expected: std::any::type_name::<T>(),
            value,
        }),
        Err(_) => Ok(default),
    }
}
