use config::{builder::DefaultState, ConfigBuilder, Environment};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Postgres URL; absent means the in-memory store
    pub database_url: Option<String>,
    pub bind_address: String,
    pub hold_ttl_hours: i64,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
    pub store_timeout_ms: u64,
    pub db_max_connections: u32,
    pub webhook_rate_limit_per_minute: u32,
    /// Comma-separated origins; absent or "*" allows any origin
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Self::from_builder(
            config::Config::builder().add_source(Environment::default().try_parsing(true)),
        )
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> AppResult<Self> {
        let config: Config = builder
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("hold_ttl_hours", 72)?
            .set_default("sweep_interval_secs", 300)?
            .set_default("sweep_batch_size", 500)?
            .set_default("store_timeout_ms", 5000)?
            .set_default("db_max_connections", 20)?
            .set_default("webhook_rate_limit_per_minute", 600)?
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let checks = [
            (self.hold_ttl_hours > 0, "HOLD_TTL_HOURS must be positive"),
            (self.sweep_interval_secs > 0, "SWEEP_INTERVAL_SECS must be positive"),
            (self.sweep_batch_size > 0, "SWEEP_BATCH_SIZE must be positive"),
            (self.store_timeout_ms > 0, "STORE_TIMEOUT_MS must be positive"),
            (self.db_max_connections > 0, "DB_MAX_CONNECTIONS must be positive"),
            (
                self.webhook_rate_limit_per_minute > 0,
                "WEBHOOK_RATE_LIMIT_PER_MINUTE must be positive",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(AppError::Config(message.to_string())),
            None => Ok(()),
        }
    }

    pub fn database_url(&self) -> Option<&str> {
        self.database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn hold_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.hold_ttl_hours)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Explicit origins, or empty for "any origin".
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty() && *o != "*")
            .map(String::from)
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_address: "0.0.0.0:8080".to_string(),
            hold_ttl_hours: 72,
            sweep_interval_secs: 300,
            sweep_batch_size: 500,
            store_timeout_ms: 5000,
            db_max_connections: 20,
            webhook_rate_limit_per_minute: 600,
            cors_allowed_origins: None,
        }
    }
}
