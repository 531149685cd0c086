//! Worker process configuration.

use std::env;
use std::net::SocketAddr;

use sierra_webhooks::{WebhookConfig, WebhookError};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8090";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub listen_addr: SocketAddr,
    pub log_filter: String,
    pub webhook: WebhookConfig,
}

impl WorkerConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is missing or any value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingVar("DATABASE_URL"))?;

        let listen_addr = lookup("SIERRA_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                var: "SIERRA_LISTEN_ADDR",
                reason: e.to_string(),
            })?;

        let db_max_connections = match lookup("SIERRA_DB_MAX_CONNECTIONS") {
            Some(v) => v.trim().parse::<u32>().map_err(|e| ConfigError::InvalidValue {
                var: "SIERRA_DB_MAX_CONNECTIONS",
                reason: e.to_string(),
            })?,
            None => DEFAULT_DB_MAX_CONNECTIONS,
        };

        let log_filter = lookup("SIERRA_LOG_FILTER")
            .unwrap_or_else(|| crate::logging::DEFAULT_LOG_FILTER.to_string());

        Ok(Self {
            database_url,
            db_max_connections,
            listen_addr,
            log_filter,
            webhook: WebhookConfig::from_lookup(&lookup)?,
        })
    }
}
