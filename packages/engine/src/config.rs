use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::kernel::engine::EngineSettings;
use crate::kernel::generator::{FieldLimits, GeneratorConfig};
use crate::kernel::store_api::StoreApiConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Broker database; defaults to the main database.
    pub queue_url: String,
    pub kv_url: String,
    pub generator_api_url: String,
    pub generator_api_key: String,
    pub generator_model: String,

    pub tenant_lock_ttl: Duration,
    pub tenant_lock_retry_delay: Duration,
    pub stuck_after: Duration,
    pub lease_ttl: Duration,

    pub generator_max_attempts: u32,
    pub generator_timeout: Duration,
    pub generator_backoff_base: Duration,

    pub store_api_max_attempts: u32,
    pub store_api_timeout: Duration,
    pub store_api_backoff_base: Duration,
    pub throttle_min_available: f64,
    pub throttle_max_wait: Duration,

    pub free_monthly_limit: i32,
    pub free_time_zone: chrono_tz::Tz,

    pub title_max: usize,
    pub description_max: usize,
    pub alt_max: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let free_time_zone = env::var("FREE_TIME_ZONE")
            .unwrap_or_else(|_| "Europe/Istanbul".to_string())
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("FREE_TIME_ZONE is not a valid timezone: {e}"))?;

        Ok(Self {
            queue_url: env::var("QUEUE_URL").unwrap_or_else(|_| database_url.clone()),
            database_url,
            kv_url: env::var("KV_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            generator_api_url: env::var("GENERATOR_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            generator_api_key: env::var("GENERATOR_API_KEY")
                .context("GENERATOR_API_KEY must be set")?,
            generator_model: env::var("GENERATOR_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),

            tenant_lock_ttl: secs_var("TENANT_LOCK_TTL_SECS", 900)?,
            tenant_lock_retry_delay: secs_var("TENANT_LOCK_RETRY_DELAY_SECS", 10)?,
            stuck_after: secs_var("STUCK_AFTER_SECS", 600)?,
            lease_ttl: secs_var("LEASE_TTL_SECS", 300)?,

            generator_max_attempts: parse_var("GENERATOR_MAX_ATTEMPTS", 3)?,
            generator_timeout: secs_var("GENERATOR_TIMEOUT_SECS", 60)?,
            generator_backoff_base: millis_var("GENERATOR_BACKOFF_BASE_MS", 1000)?,

            store_api_max_attempts: parse_var("STORE_API_MAX_ATTEMPTS", 3)?,
            store_api_timeout: secs_var("STORE_API_TIMEOUT_SECS", 30)?,
            store_api_backoff_base: millis_var("STORE_API_BACKOFF_BASE_MS", 1000)?,
            throttle_min_available: parse_var("THROTTLE_MIN_AVAILABLE", 100.0)?,
            throttle_max_wait: millis_var("THROTTLE_MAX_WAIT_MS", 5000)?,

            free_monthly_limit: parse_var("FREE_MONTHLY_LIMIT", 10)?,
            free_time_zone,

            title_max: parse_var("TITLE_MAX", 60)?,
            description_max: parse_var("DESCRIPTION_MAX", 160)?,
            alt_max: parse_var("ALT_MAX", 125)?,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            lease_ttl: self.lease_ttl,
            tenant_lock_ttl: self.tenant_lock_ttl,
            tenant_lock_retry_delay: self.tenant_lock_retry_delay,
            stuck_after: self.stuck_after,
            free_monthly_limit: self.free_monthly_limit,
            free_time_zone: self.free_time_zone,
            ..EngineSettings::default()
        }
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            max_attempts: self.generator_max_attempts,
            backoff_base: self.generator_backoff_base,
            timeout: self.generator_timeout,
            limits: FieldLimits {
                title_max: self.title_max,
                description_max: self.description_max,
                alt_max: self.alt_max,
            },
        }
    }

    pub fn store_api_config(&self) -> StoreApiConfig {
        StoreApiConfig {
            max_attempts: self.store_api_max_attempts,
            timeout: self.store_api_timeout,
            backoff_base: self.store_api_backoff_base,
            throttle_min_available: self.throttle_min_available,
            throttle_max_wait: self.throttle_max_wait,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{name} is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &'static str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parse_var(name, default_secs)?))
}

fn millis_var(name: &'static str, default_ms: u64) -> Result<Duration> {
    Ok(Duration::from_millis(parse_var(name, default_ms)?))
}
