//! Process-wide cache registry
//!
//! Built once at startup and passed to every component that needs a cache. Owns the shared
//! backend, the lazily created per-service breakers and the metrics registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitPhase};
use super::memory_cache::MemoryCacheBackend;
use super::redis_cache::RedisCacheBackend;
use super::service_cache::ServiceCache;
use super::{CacheBackend, CacheConfig, CacheStats};
use crate::config::BreakerConfig;
use crate::error::ServiceError;
use crate::metrics::CoreMetrics;

struct ServiceSlot {
    breaker: Arc<CircuitBreaker>,
    stats: Arc<Mutex<CacheStats>>,
}

pub struct CacheRegistry {
    config: CacheConfig,
    breaker_config: BreakerConfig,
    backend: Arc<dyn CacheBackend>,
    services: Mutex<HashMap<String, ServiceSlot>>,
    metrics: Arc<CoreMetrics>,
}

/// Health snapshot of one service namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCacheHealth {
    pub service: String,
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub stats: CacheStats,
}

impl CacheRegistry {
    /// Connect to Redis, falling back to the in-process backend if it is unreachable.
    pub async fn connect(
        config: CacheConfig,
        breaker_config: BreakerConfig,
    ) -> Result<Self, ServiceError> {
        info!("Initializing cache registry");

        let backend: Arc<dyn CacheBackend> = if config.memory_only {
            info!("Cache configured as memory-only");
            Arc::new(MemoryCacheBackend::new(config.memory_cache_size))
        } else {
            match RedisCacheBackend::connect(&config).await {
                Ok(redis) => Arc::new(redis),
                Err(e) => {
                    warn!("Failed to initialize Redis cache, using memory cache only: {}", e);
                    Arc::new(MemoryCacheBackend::new(config.memory_cache_size))
                }
            }
        };

        Self::with_backend(config, breaker_config, backend)
    }

    /// Build around an existing backend.
    pub fn with_backend(
        config: CacheConfig,
        breaker_config: BreakerConfig,
        backend: Arc<dyn CacheBackend>,
    ) -> Result<Self, ServiceError> {
        let metrics = CoreMetrics::new()
            .map_err(|e| ServiceError::ConfigError(format!("Failed to register metrics: {}", e)))?;

        info!("Cache registry using {} backend", backend.name());
        Ok(Self {
            config,
            breaker_config,
            backend,
            services: Mutex::new(HashMap::new()),
            metrics: Arc::new(metrics),
        })
    }

    /// Registry over a fresh in-process backend.
    pub fn in_memory(global_prefix: &str) -> Result<Self, ServiceError> {
        let config = CacheConfig::memory(global_prefix);
        let backend = Arc::new(MemoryCacheBackend::new(config.memory_cache_size));
        Self::with_backend(config, BreakerConfig::default(), backend)
    }

    /// Cache handle for `service`. Handles for the same name share one breaker.
    pub fn service(&self, service: &str) -> ServiceCache {
        let mut services = self.services.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = services.entry(service.to_string()).or_insert_with(|| ServiceSlot {
            breaker: Arc::new(CircuitBreaker::new(service, self.breaker_config.clone())),
            stats: Arc::new(Mutex::new(CacheStats::default())),
        });

        ServiceCache::new(
            service.to_string(),
            self.config.global_prefix.clone(),
            self.config.max_key_length,
            self.config.max_value_size_bytes,
            self.backend.clone(),
            slot.breaker.clone(),
            slot.stats.clone(),
            self.metrics.clone(),
        )
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<CoreMetrics> {
        self.metrics.clone()
    }

    /// Breaker phase and counters for every service seen so far, sorted by name.
    pub fn health(&self) -> Vec<ServiceCacheHealth> {
        let services = self.services.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut report: Vec<ServiceCacheHealth> = services
            .iter()
            .map(|(name, slot)| {
                let state = slot.breaker.state();
                let mut stats = slot
                    .stats
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                stats.calculate_hit_rate();
                ServiceCacheHealth {
                    service: name.clone(),
                    phase: state.phase,
                    failure_count: state.failure_count,
                    stats,
                }
            })
            .collect();
        report.sort_by(|a, b| a.service.cmp(&b.service));
        report
    }
}
