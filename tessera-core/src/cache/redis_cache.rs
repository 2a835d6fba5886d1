//! Redis cache backend
//!
//! Pooled connections via deadpool-redis. Conditional deletes and TTL refreshes run as Lua
//! scripts so the compare and the write happen atomically on the server.

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime, Timeouts};
use redis::Script;
use std::time::Duration;
use tracing::{debug, info};

use super::{CacheBackend, CacheConfig};
use crate::config::redact_url;
use crate::error::ServiceError;

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis cache backend
pub struct RedisCacheBackend {
    pool: Pool,
    delete_if_equals: Script,
    expire_if_equals: Script,
}

impl RedisCacheBackend {
    /// Create the pool and verify the server answers PING
    pub async fn connect(config: &CacheConfig) -> Result<Self, ServiceError> {
        info!("Initializing Redis cache backend with URL: {}", redact_url(&config.redis_url));

        let timeout = Duration::from_millis(config.redis_timeout_ms);
        let mut redis_config = Config::from_url(config.redis_url.clone());
        redis_config.pool = Some(PoolConfig {
            max_size: config.redis_pool_size.max(1),
            timeouts: Timeouts {
                wait: Some(timeout),
                create: Some(timeout),
                recycle: Some(timeout),
            },
            ..PoolConfig::default()
        });

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ServiceError::ConfigError(format!("Failed to create Redis pool: {}", e)))?;

        let backend = Self {
            pool,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
        };
        backend.ping().await?;

        info!("Redis cache backend initialized successfully");
        Ok(backend)
    }

    pub async fn ping(&self) -> Result<(), ServiceError> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry.
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ServiceError> {
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, ServiceError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, ServiceError> {
        let mut conn = self.pool.get().await?;
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, ServiceError> {
        debug!("Listing Redis keys for pattern: {}", pattern);
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        Ok(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ServiceError> {
        let mut conn = self.pool.get().await?;
        let updated: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, ServiceError> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        let mut conn = self.pool.get().await?;
        let updated: i64 = self
            .expire_if_equals
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(updated > 0)
    }
}
