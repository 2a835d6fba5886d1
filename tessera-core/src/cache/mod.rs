//! Caching infrastructure shared by every platform service
//!
//! Provides a namespaced cache façade with a per-service circuit breaker on top of a shared
//! backend (Redis, or an in-process map when Redis is not reachable).

pub mod circuit_breaker;
pub mod codec;
pub mod memory_cache;
pub mod redis_cache;
pub mod registry;
pub mod service_cache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::env_or;
use crate::error::ServiceError;

pub use circuit_breaker::{CircuitBreaker, CircuitPhase, CircuitState};
pub use codec::{CacheCodec, JsonCodec};
pub use memory_cache::MemoryCacheBackend;
pub use redis_cache::RedisCacheBackend;
pub use registry::CacheRegistry;
pub use service_cache::{CacheNamespace, ServiceCache};

/// Cache key within one service namespace.
///
/// Rendered as `{globalPrefix}{service}:{purpose}:{id}`; the prefix and service come from the
/// `ServiceCache` that renders it, so two services can never collide in a shared backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub purpose: String,
    pub id: String,
}

impl CacheKey {
    pub fn new(purpose: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            id: id.into(),
        }
    }

    /// Generate the backend key string
    pub fn render(&self, global_prefix: &str, service: &str) -> String {
        format!("{}{}:{}:{}", global_prefix, service, self.purpose, self.id)
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub backend_failures: u64,
    pub short_circuits: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

/// Raw key-value protocol the cache backends speak.
///
/// Keys passed here are fully rendered. Values are UTF-8 payloads. Every method reports
/// backend faults as errors; degrading them into misses is `ServiceCache`'s job.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name used in logs
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError>;

    /// Store `value`, replacing any previous value; `ttl = None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ServiceError>;

    /// Store `value` only if `key` is absent. Returns whether the value was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError>;

    /// Delete `keys`, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, ServiceError>;

    async fn exists(&self, key: &str) -> Result<bool, ServiceError>;

    /// Keys matching a glob pattern (`*`, `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, ServiceError>;

    /// Reset the TTL of an existing key. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ServiceError>;

    /// Delete `key` only while it still holds `expected`, atomically.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, ServiceError>;

    /// Reset `key`'s TTL only while it still holds `expected`, atomically.
    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError>;
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub redis_url: String,
    pub redis_pool_size: usize,
    pub redis_timeout_ms: u64,
    /// Prepended to every key, e.g. `"tessera:"`.
    pub global_prefix: String,
    /// Skip Redis entirely and use the in-process backend.
    pub memory_only: bool,
    /// Maximum number of entries held by the in-process backend.
    pub memory_cache_size: u64,
    pub max_key_length: usize,
    pub max_value_size_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            redis_pool_size: 10,
            redis_timeout_ms: 5000,
            global_prefix: "tessera:".to_string(),
            memory_only: false,
            memory_cache_size: 10_000,
            max_key_length: 512,
            max_value_size_bytes: 1024 * 1024, // 1MB
        }
    }
}

impl CacheConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env_or("REDIS_URL", defaults.redis_url),
            redis_pool_size: env_or("REDIS_POOL_SIZE", defaults.redis_pool_size),
            redis_timeout_ms: env_or("REDIS_TIMEOUT_MS", defaults.redis_timeout_ms),
            global_prefix: env_or("CACHE_GLOBAL_PREFIX", defaults.global_prefix),
            memory_only: env_or("CACHE_MEMORY_ONLY", defaults.memory_only),
            memory_cache_size: env_or("CACHE_MEMORY_SIZE", defaults.memory_cache_size).max(1),
            max_key_length: env_or("CACHE_MAX_KEY_LENGTH", defaults.max_key_length),
            max_value_size_bytes: env_or("CACHE_MAX_VALUE_BYTES", defaults.max_value_size_bytes),
        }
    }

    /// In-process configuration for tests and single-node development.
    pub fn memory(global_prefix: impl Into<String>) -> Self {
        Self {
            global_prefix: global_prefix.into(),
            memory_only: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_namespaced_by_prefix_and_service() {
        let key = CacheKey::new("profile", "42");
        assert_eq!(key.render("tessera:", "users"), "tessera:users:profile:42");
        assert_ne!(key.render("tessera:", "users"), key.render("tessera:", "content"));
    }

    #[test]
    fn hit_rate_handles_zero_traffic() {
        let mut stats = CacheStats::default();
        stats.calculate_hit_rate();
        assert_eq!(stats.hit_rate, 0.0);

        stats.hits = 3;
        stats.misses = 1;
        stats.calculate_hit_rate();
        assert_eq!(stats.hit_rate, 0.75);
    }
}
