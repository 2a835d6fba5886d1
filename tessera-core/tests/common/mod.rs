//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_core::cache::{CacheBackend, CacheConfig, CacheRegistry, MemoryCacheBackend};
use tessera_core::config::BreakerConfig;
use tessera_core::database::{initialize_database, DatabaseConfig, DatabasePool};
use tessera_core::ServiceError;

/// Memory backend that counts calls and can be switched into a failing state.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryCacheBackend,
    calls: AtomicU64,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every call take `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::BackendUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError> {
        self.enter().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ServiceError> {
        self.enter().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        self.enter().await?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, ServiceError> {
        self.enter().await?;
        self.inner.del(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool, ServiceError> {
        self.enter().await?;
        self.inner.exists(key).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, ServiceError> {
        self.enter().await?;
        self.inner.keys(pattern).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ServiceError> {
        self.enter().await?;
        self.inner.expire(key, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, ServiceError> {
        self.enter().await?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        self.enter().await?;
        self.inner.expire_if_equals(key, expected, ttl).await
    }
}

/// Test helper to create a registry over a flaky backend
pub fn flaky_registry(breaker: BreakerConfig) -> (CacheRegistry, Arc<FlakyBackend>) {
    let backend = Arc::new(FlakyBackend::new());
    let registry =
        CacheRegistry::with_backend(CacheConfig::memory("test:"), breaker, backend.clone())
            .expect("registry");
    (registry, backend)
}

/// Test helper to create a migrated single-connection SQLite pool
pub async fn sqlite_pool() -> DatabasePool {
    let mut config = DatabaseConfig::sqlite("sqlite::memory:".to_string());
    config.max_connections = 1;
    initialize_database(&config).await.expect("sqlite pool")
}
