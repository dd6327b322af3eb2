use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};

const DEFAULT_CONFLICT_RETRIES: u32 = 5;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
    pub database_max_connections: u32,
    /// Attempts per ledger write before a conflict is surfaced.
    pub conflict_retries: u32,
    pub reconcile_interval: Duration,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;
        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());

        Ok(Self {
            database_url,
            redis_url,
            http_addr,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            conflict_retries: env_or("LEDGER_CONFLICT_RETRIES", DEFAULT_CONFLICT_RETRIES)?,
            reconcile_interval: Duration::from_secs(env_or(
                "RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL_SECS,
            )?),
        })
    }

    pub fn worker_from_env() -> Result<Self> {
        let mut config = Self::from_env("")?;
        config.http_addr = String::new();
        Ok(config)
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_or(name, std::env::var(name).ok(), default)
}

fn parse_or<T>(name: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value
            .parse()
            .with_context(|| format!("{name} must be a number, got {value:?}")),
        None => Ok(default),
    }
}
