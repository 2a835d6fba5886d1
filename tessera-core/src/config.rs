//! Process-level configuration for the core primitives
//!
//! Every section has a `Default` and can be read from the environment; a host process builds
//! one `CoreConfig` at startup and hands the sections to the components it constructs.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::database::connection::DatabaseConfig;
use crate::retry::RetryPolicy;

/// Circuit breaker tuning shared by every service namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive backend failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit short-circuits before admitting a trial call.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: env_or("CACHE_BREAKER_THRESHOLD", defaults.failure_threshold).max(1),
            cooldown: Duration::from_secs(env_or(
                "CACHE_BREAKER_COOLDOWN_SECONDS",
                defaults.cooldown.as_secs(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Cache service namespace holding lock keys.
    pub service: String,
    pub default_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            service: "locks".to_string(),
            default_ttl: Duration::from_secs(30),
            retry: RetryPolicy::lock_default(),
        }
    }
}

impl LockConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service: env_or("LOCK_SERVICE", defaults.service),
            default_ttl: Duration::from_secs(env_or(
                "LOCK_DEFAULT_TTL_SECONDS",
                defaults.default_ttl.as_secs(),
            )),
            retry: retry_from_env("LOCK", &defaults.retry),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Cache service namespace holding mappings and write-through records.
    pub service: String,
    /// Canonical records fetched per sweep page.
    pub page_size: usize,
    /// TTL of write-through copies of canonical records.
    pub record_ttl: Duration,
    /// Retries for transient mirror failures.
    pub retry: RetryPolicy,
    /// Capacity of the write-event queue.
    pub queue_capacity: usize,
    /// Interval between reconciliation sweeps.
    pub sweep_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            service: "sync".to_string(),
            page_size: 100,
            record_ttl: Duration::from_secs(300),
            retry: RetryPolicy::sync_default(),
            queue_capacity: 1024,
            sweep_interval: Duration::from_secs(900),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service: env_or("SYNC_SERVICE", defaults.service),
            page_size: env_or("SYNC_PAGE_SIZE", defaults.page_size).max(1),
            record_ttl: Duration::from_secs(env_or(
                "SYNC_RECORD_TTL_SECONDS",
                defaults.record_ttl.as_secs(),
            )),
            retry: retry_from_env("SYNC", &defaults.retry),
            queue_capacity: env_or("SYNC_QUEUE_CAPACITY", defaults.queue_capacity).max(1),
            sweep_interval: Duration::from_secs(env_or(
                "SYNC_SWEEP_INTERVAL_SECONDS",
                defaults.sweep_interval.as_secs(),
            )),
        }
    }
}

/// Top-level configuration assembled once per process.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub lock: LockConfig,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self {
            cache: CacheConfig::from_env(),
            breaker: BreakerConfig::from_env(),
            lock: LockConfig::from_env(),
            sync: SyncConfig::from_env(),
            database: DatabaseConfig::from_env(),
        }
    }
}

/// `{prefix}_MAX_ATTEMPTS`, `{prefix}_BASE_DELAY_MS` and `{prefix}_MAX_DELAY_MS` over `defaults`.
fn retry_from_env(prefix: &str, defaults: &RetryPolicy) -> RetryPolicy {
    RetryPolicy::new(
        env_or(&format!("{}_MAX_ATTEMPTS", prefix), defaults.max_attempts).max(1),
        Duration::from_millis(env_or(
            &format!("{}_BASE_DELAY_MS", prefix),
            defaults.base_delay.as_millis() as u64,
        )),
        Duration::from_millis(env_or(
            &format!("{}_MAX_DELAY_MS", prefix),
            defaults.max_delay.as_millis() as u64,
        )),
        defaults.jitter,
    )
}

/// Strip credentials from a connection URL before logging it
pub(crate) fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Reads `name` from the environment, falling back to `default` when unset or unparsable.
pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
