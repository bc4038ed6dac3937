//! Typed, environment-sourced configuration. `Config::from_env` is the only
//! place in the binary allowed to read environment variables directly.

use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub amqp_url: String,
    pub vendor_base_url: String,
    pub worker_count: usize,
    pub queue_prefetch: u16,
    pub circuit_breaker_min_calls: u32,
    pub circuit_breaker_error_rate: f64,
    pub circuit_breaker_open_duration: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            amqp_url: required_env("AMQP_URL")?,
            vendor_base_url: required_env("VENDOR_BASE_URL")?,
            worker_count: optional_env("WORKER_COUNT", 5)?,
            queue_prefetch: optional_env("QUEUE_PREFETCH", 5)?,
            circuit_breaker_min_calls: optional_env("CIRCUIT_BREAKER_MIN_CALLS", 20)?,
            circuit_breaker_error_rate: optional_env("CIRCUIT_BREAKER_ERROR_RATE", 0.5)?,
            circuit_breaker_open_duration: Duration::from_secs(optional_env(
                "CIRCUIT_BREAKER_OPEN_DURATION_SECS",
                30,
            )?),
        })
    }
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn optional_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}
