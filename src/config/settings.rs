// src/config/settings.rs
//! Process-wide settings read from the environment (`.env` is loaded by the binaries).

use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::ingest::PipelineSettings;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/data_processing.db";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    pub db_pool_size: u32,
    pub rate_limit: usize,
    pub workers: usize,
    pub chunk_size: usize,
    pub unit_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Empty means the data routes are open.
    pub api_key: String,
    pub cors_origins: Vec<String>,
    pub schedule_interval_minutes: u64,
    pub scheduler_enabled: bool,
    pub metrics_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            db_pool_size: 10,
            rate_limit: 10,
            workers: 4,
            chunk_size: 1000,
            unit_timeout: Duration::from_secs(300),
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(60_000),
            api_key: String::new(),
            cors_origins: vec!["*".to_string()],
            schedule_interval_minutes: 60,
            scheduler_enabled: false,
            metrics_port: 8000,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let d = Self::default();

        let s = Self {
            database_url: get("DATABASE_URL").unwrap_or(d.database_url),
            db_pool_size: parse_or(&get, "DB_POOL_SIZE", d.db_pool_size)?,
            rate_limit: parse_or(&get, "API_RATE_LIMIT", d.rate_limit)?,
            workers: parse_or(&get, "WORKER_THREADS", d.workers)?,
            chunk_size: parse_or(&get, "STORE_CHUNK_SIZE", d.chunk_size)?,
            unit_timeout: Duration::from_secs(parse_or(&get, "UNIT_TIMEOUT_SECS", 300u64)?),
            backoff_base: Duration::from_millis(parse_or(&get, "FETCH_BACKOFF_BASE_MS", 1000u64)?),
            backoff_max: Duration::from_millis(parse_or(&get, "FETCH_BACKOFF_MAX_MS", 60_000u64)?),
            api_key: get("API_KEY").unwrap_or_default(),
            cors_origins: get("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or(d.cors_origins),
            schedule_interval_minutes: parse_or(
                &get,
                "SCHEDULE_INTERVAL_MINUTES",
                d.schedule_interval_minutes,
            )?,
            scheduler_enabled: get("SCHEDULER_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(d.scheduler_enabled),
            metrics_port: parse_or(&get, "METRICS_PORT", d.metrics_port)?,
        };

        for (name, v) in [
            ("DB_POOL_SIZE", s.db_pool_size as usize),
            ("API_RATE_LIMIT", s.rate_limit),
            ("WORKER_THREADS", s.workers),
            ("STORE_CHUNK_SIZE", s.chunk_size),
        ] {
            if v == 0 {
                bail!("{name} must be positive");
            }
        }
        if s.unit_timeout.is_zero() {
            bail!("UNIT_TIMEOUT_SECS must be positive");
        }
        if s.backoff_max < s.backoff_base {
            bail!("FETCH_BACKOFF_MAX_MS must not be below FETCH_BACKOFF_BASE_MS");
        }
        Ok(s)
    }

    pub fn pipeline(&self) -> PipelineSettings {
        PipelineSettings {
            rate_limit: self.rate_limit,
            workers: self.workers,
            unit_timeout: self.unit_timeout,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key}={raw:?} is not a valid value")),
        None => Ok(default),
    }
}
