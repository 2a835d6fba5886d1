//! Namespaced cache façade handed to each service
//!
//! Every operation consults the service's circuit breaker before touching the backend and
//! never returns an error: backend faults degrade to a miss (`None`) or `false`, so a cache
//! outage can slow a caller down but never fail it.

use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitPhase, CircuitState};
use super::codec::{CacheCodec, JsonCodec};
use super::{CacheBackend, CacheKey, CacheStats};
use crate::error::ServiceError;
use crate::metrics::CoreMetrics;

#[derive(Clone)]
pub struct ServiceCache {
    service: String,
    global_prefix: String,
    max_key_length: usize,
    max_value_size_bytes: usize,
    backend: Arc<dyn CacheBackend>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<Mutex<CacheStats>>,
    metrics: Arc<CoreMetrics>,
}

impl ServiceCache {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        service: String,
        global_prefix: String,
        max_key_length: usize,
        max_value_size_bytes: usize,
        backend: Arc<dyn CacheBackend>,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<Mutex<CacheStats>>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            service,
            global_prefix,
            max_key_length,
            max_value_size_bytes,
            backend,
            breaker,
            stats,
            metrics,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Fully rendered backend key for `key`
    pub fn render_key(&self, key: &CacheKey) -> String {
        key.render(&self.global_prefix, &self.service)
    }

    pub async fn get_raw(&self, key: &CacheKey) -> Option<String> {
        let rendered = self.checked_key(key)?;
        if !self.admit("get") {
            return None;
        }
        let result = self.backend.get(&rendered).await;
        let value = self.settle("get", &rendered, result).flatten();

        self.update_stats(|stats| {
            if value.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        });
        self.metrics.cache_op(
            &self.service,
            "get",
            if value.is_some() { "hit" } else { "miss" },
        );
        value
    }

    /// Typed read through the JSON codec. Undecodable payloads are treated as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let payload = self.get_raw(key).await?;
        let decoded = serde_json::from_str(&payload).map_err(ServiceError::from);
        self.discard_undecodable(key, decoded)
    }

    pub async fn get_with<T, C: CacheCodec<T>>(&self, key: &CacheKey, codec: &C) -> Option<T> {
        let payload = self.get_raw(key).await?;
        self.discard_undecodable(key, codec.decode(&payload))
    }

    fn discard_undecodable<T>(
        &self,
        key: &CacheKey,
        decoded: Result<T, ServiceError>,
    ) -> Option<T> {
        match decoded {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    service = %self.service,
                    key = %self.render_key(key),
                    "Discarding undecodable cache entry: {}",
                    e
                );
                None
            }
        }
    }

    pub async fn set_raw(&self, key: &CacheKey, value: &str, ttl: Option<Duration>) -> bool {
        let Some(rendered) = self.checked_key(key) else {
            return false;
        };
        if value.len() > self.max_value_size_bytes {
            warn!(
                service = %self.service,
                "Cache value too large for {}: {} > {}",
                rendered,
                value.len(),
                self.max_value_size_bytes
            );
            return false;
        }
        if !self.admit("set") {
            return false;
        }
        debug!("Setting cache key: {} with TTL: {:?}", rendered, ttl);
        let result = self.backend.set(&rendered, value, ttl).await;
        let stored = self.settle("set", &rendered, result).is_some();
        if stored {
            self.update_stats(|stats| stats.sets += 1);
        }
        stored
    }

    /// Typed write through the JSON codec; `ttl = None` keeps the entry until deleted.
    pub async fn set<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        match serde_json::to_string(value) {
            Ok(payload) => self.set_raw(key, &payload, ttl).await,
            Err(e) => {
                warn!(
                    service = %self.service,
                    "Cache encode failed for {}: {}",
                    self.render_key(key),
                    e
                );
                false
            }
        }
    }

    pub async fn set_with<T, C: CacheCodec<T>>(
        &self,
        key: &CacheKey,
        value: &T,
        codec: &C,
        ttl: Option<Duration>,
    ) -> bool {
        match codec.encode(value) {
            Ok(payload) => self.set_raw(key, &payload, ttl).await,
            Err(e) => {
                warn!(
                    service = %self.service,
                    "Cache encode failed for {}: {}",
                    self.render_key(key),
                    e
                );
                false
            }
        }
    }

    /// Delete one entry. Returns true if an entry was removed.
    pub async fn del(&self, key: &CacheKey) -> bool {
        let Some(rendered) = self.checked_key(key) else {
            return false;
        };
        if !self.admit("del") {
            return false;
        }
        let result = self.backend.del(std::slice::from_ref(&rendered)).await;
        let removed = self.settle("del", &rendered, result).unwrap_or(0);
        self.update_stats(|stats| stats.deletes += removed);
        removed > 0
    }

    /// Delete every entry of this service matching `pattern` (a glob relative to the service
    /// namespace, e.g. `"profile:*"`). Returns the number of entries removed.
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let full_pattern = format!("{}{}:{}", self.global_prefix, self.service, pattern);
        if !self.admit("delete_by_pattern") {
            return 0;
        }
        let listed = self.backend.keys(&full_pattern).await;
        let Some(keys) = self.settle("keys", &full_pattern, listed) else {
            return 0;
        };
        if keys.is_empty() {
            return 0;
        }

        if !self.admit("delete_by_pattern") {
            return 0;
        }
        let result = self.backend.del(&keys).await;
        let removed = self.settle("del", &full_pattern, result).unwrap_or(0);
        self.update_stats(|stats| stats.deletes += removed);
        debug!("Invalidated {} cache entries matching pattern: {}", removed, full_pattern);
        removed
    }

    pub async fn exists(&self, key: &CacheKey) -> bool {
        let Some(rendered) = self.checked_key(key) else {
            return false;
        };
        if !self.admit("exists") {
            return false;
        }
        let result = self.backend.exists(&rendered).await;
        self.settle("exists", &rendered, result).unwrap_or(false)
    }

    /// Reset the TTL of an existing entry.
    pub async fn expire(&self, key: &CacheKey, ttl: Duration) -> bool {
        let Some(rendered) = self.checked_key(key) else {
            return false;
        };
        if !self.admit("expire") {
            return false;
        }
        let result = self.backend.expire(&rendered, ttl).await;
        self.settle("expire", &rendered, result).unwrap_or(false)
    }

    /// Atomically create `key = value` with `ttl` if absent. Returns whether it was created;
    /// `false` also covers an unavailable backend.
    pub async fn set_if_absent(&self, key: &CacheKey, value: &str, ttl: Duration) -> bool {
        let Some(rendered) = self.checked_key(key) else {
            return false;
        };
        if !self.admit("set_if_absent") {
            return false;
        }
        let result = self.backend.set_if_absent(&rendered, value, ttl).await;
        self.settle("set_if_absent", &rendered, result).unwrap_or(false)
    }

    /// Atomically delete `key` only while it still holds `expected`.
    pub async fn delete_if_equals(&self, key: &CacheKey, expected: &str) -> bool {
        let Some(rendered) = self.checked_key(key) else {
            return false;
        };
        if !self.admit("delete_if_equals") {
            return false;
        }
        let result = self.backend.delete_if_equals(&rendered, expected).await;
        self.settle("delete_if_equals", &rendered, result).unwrap_or(false)
    }

    /// Atomically refresh `key`'s TTL only while it still holds `expected`.
    pub async fn expire_if_equals(&self, key: &CacheKey, expected: &str, ttl: Duration) -> bool {
        let Some(rendered) = self.checked_key(key) else {
            return false;
        };
        if !self.admit("expire_if_equals") {
            return false;
        }
        let result = self.backend.expire_if_equals(&rendered, expected, ttl).await;
        self.settle("expire_if_equals", &rendered, result).unwrap_or(false)
    }

    /// Typed view over one purpose of this service.
    pub fn namespace<T>(&self, purpose: impl Into<String>) -> CacheNamespace<T, JsonCodec>
    where
        T: Serialize + DeserializeOwned,
    {
        CacheNamespace::new(self.clone(), purpose.into(), JsonCodec)
    }

    pub fn namespace_with_codec<T, C: CacheCodec<T>>(
        &self,
        purpose: impl Into<String>,
        codec: C,
    ) -> CacheNamespace<T, C> {
        CacheNamespace::new(self.clone(), purpose.into(), codec)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        stats.calculate_hit_rate();
        stats
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    fn checked_key(&self, key: &CacheKey) -> Option<String> {
        let rendered = self.render_key(key);
        if rendered.len() > self.max_key_length {
            warn!(
                service = %self.service,
                "Cache key too long: {} > {}",
                rendered.len(),
                self.max_key_length
            );
            return None;
        }
        Some(rendered)
    }

    fn admit(&self, operation: &str) -> bool {
        if self.breaker.admit().is_permitted() {
            return true;
        }
        debug!(service = %self.service, operation, "Cache circuit open, skipping backend");
        self.update_stats(|stats| stats.short_circuits += 1);
        self.metrics.cache_op(&self.service, operation, "short_circuit");
        false
    }

    fn settle<T>(&self, operation: &str, key: &str, result: Result<T, ServiceError>) -> Option<T> {
        match result {
            Ok(value) => {
                if self.breaker.record_success() {
                    self.record_transition(CircuitPhase::Closed);
                }
                Some(value)
            }
            Err(e) => {
                warn!(
                    service = %self.service,
                    backend = self.backend.name(),
                    operation,
                    "Cache backend error for {}: {}",
                    key,
                    e
                );
                self.update_stats(|stats| stats.backend_failures += 1);
                self.metrics.cache_op(&self.service, operation, "error");
                if self.breaker.record_failure() {
                    self.record_transition(CircuitPhase::Open);
                }
                None
            }
        }
    }

    fn record_transition(&self, phase: CircuitPhase) {
        self.metrics
            .circuit_transitions
            .with_label_values(&[&self.service, phase.as_str()])
            .inc();
    }

    fn update_stats<F>(&self, update_fn: F)
    where
        F: FnOnce(&mut CacheStats),
    {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        update_fn(&mut stats);
    }
}

/// Typed, codec-bound view over `{service}:{purpose}:*`.
pub struct CacheNamespace<T, C = JsonCodec> {
    cache: ServiceCache,
    purpose: String,
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: CacheCodec<T>> CacheNamespace<T, C> {
    fn new(cache: ServiceCache, purpose: String, codec: C) -> Self {
        Self {
            cache,
            purpose,
            codec,
            _marker: PhantomData,
        }
    }

    pub fn key(&self, id: &str) -> CacheKey {
        CacheKey::new(self.purpose.clone(), id)
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        self.cache.get_with(&self.key(id), &self.codec).await
    }

    pub async fn set(&self, id: &str, value: &T, ttl: Option<Duration>) -> bool {
        self.cache.set_with(&self.key(id), value, &self.codec, ttl).await
    }

    pub async fn del(&self, id: &str) -> bool {
        self.cache.del(&self.key(id)).await
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.cache.exists(&self.key(id)).await
    }

    /// Drop every entry of this namespace.
    pub async fn clear(&self) -> u64 {
        self.cache.delete_by_pattern(&format!("{}:*", self.purpose)).await
    }
}
