//! Distributed locks on top of the shared cache
//!
//! A lock is a cache entry `lock:{key} = ownerToken` created with set-if-absent and a TTL.
//! The TTL bounds how long a crashed holder can block others; release is compare-and-delete
//! so a holder whose TTL lapsed can never remove a lock somebody else acquired since.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, CacheRegistry, ServiceCache};
use crate::config::LockConfig;
use crate::error::ServiceError;
use crate::metrics::CoreMetrics;
use crate::retry::RetryPolicy;

const LOCK_PURPOSE: &str = "lock";

/// Proof of ownership returned by `LockManager::acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    key: String,
    token: String,
    ttl: Duration,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

pub struct LockManager {
    cache: ServiceCache,
    retry: RetryPolicy,
    default_ttl: Duration,
    metrics: Option<Arc<CoreMetrics>>,
}

impl LockManager {
    pub fn new(cache: ServiceCache, retry: RetryPolicy) -> Self {
        Self {
            cache,
            retry,
            default_ttl: LockConfig::default().default_ttl,
            metrics: None,
        }
    }

    pub fn from_config(cache: ServiceCache, config: &LockConfig) -> Self {
        let mut manager = Self::new(cache, config.retry.clone());
        manager.default_ttl = config.default_ttl;
        manager
    }

    /// Lock manager on the registry's `config.service` namespace, reporting into its metrics.
    pub fn from_registry(registry: &CacheRegistry, config: &LockConfig) -> Self {
        Self::from_config(registry.service(&config.service), config)
            .with_metrics(registry.metrics())
    }

    pub fn with_metrics(mut self, metrics: Arc<CoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn cache_key(key: &str) -> CacheKey {
        CacheKey::new(LOCK_PURPOSE, key)
    }

    /// Run `body` while holding the lock for `key`.
    ///
    /// The lock is released on every exit path: success, error and panic. Errors from `body`
    /// are returned after the release.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        body: F,
    ) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let guard = self.acquire(key, ttl).await?;

        let outcome = AssertUnwindSafe(body()).catch_unwind().await;
        self.release(&guard).await;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// `with_lock` using the configured default TTL.
    pub async fn with_lock_default<T, F, Fut>(&self, key: &str, body: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.with_lock(key, self.default_ttl, body).await
    }

    /// Acquire the lock for `key`, retrying with jittered backoff.
    ///
    /// Fails with `LockTimeout` once the retry policy's attempts are exhausted.
    #[instrument(skip(self))]
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, ServiceError> {
        let token = Uuid::new_v4().to_string();
        let cache_key = Self::cache_key(key);

        for attempt in 1..=self.retry.max_attempts {
            if self.cache.set_if_absent(&cache_key, &token, ttl).await {
                debug!("Acquired lock {} on attempt {}", key, attempt);
                self.record("acquired");
                return Ok(LockGuard {
                    key: key.to_string(),
                    token,
                    ttl,
                });
            }

            if attempt < self.retry.max_attempts {
                self.record("contended");
                tokio::time::sleep(self.retry.next_delay(attempt)).await;
            }
        }

        warn!(
            "Timed out acquiring lock {} after {} attempts",
            key, self.retry.max_attempts
        );
        self.record("timeout");
        Err(ServiceError::LockTimeout {
            key: key.to_string(),
            attempts: self.retry.max_attempts,
        })
    }

    /// Single non-blocking attempt.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockGuard> {
        let token = Uuid::new_v4().to_string();
        if self.cache.set_if_absent(&Self::cache_key(key), &token, ttl).await {
            self.record("acquired");
            Some(LockGuard {
                key: key.to_string(),
                token,
                ttl,
            })
        } else {
            None
        }
    }

    /// Release the lock if `guard` still owns it. Returns false when the lock had expired and
    /// was taken over (or the cache was unreachable); the stored value is left untouched.
    pub async fn release(&self, guard: &LockGuard) -> bool {
        let released = self
            .cache
            .delete_if_equals(&Self::cache_key(&guard.key), &guard.token)
            .await;
        if released {
            debug!("Released lock {}", guard.key);
        } else {
            info!(
                "Lock {} was no longer held by this owner at release; leaving it in place",
                guard.key
            );
            self.record("lost");
        }
        released
    }

    /// Extend the lock's TTL while `guard` still owns it.
    pub async fn extend(&self, guard: &LockGuard, ttl: Duration) -> bool {
        self.cache
            .expire_if_equals(&Self::cache_key(&guard.key), &guard.token, ttl)
            .await
    }

    /// Whether anyone currently holds the lock for `key`.
    pub async fn is_locked(&self, key: &str) -> bool {
        self.cache.exists(&Self::cache_key(key)).await
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.lock_acquisitions.with_label_values(&[outcome]).inc();
        }
    }
}
