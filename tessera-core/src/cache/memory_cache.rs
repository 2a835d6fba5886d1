//! In-process cache backend
//!
//! Used when Redis is unavailable at startup, for single-node development, and in tests.
//! Entries live in a bounded moka cache that expires each one after the TTL it was written
//! with. Every entry also carries its deadline on the tokio clock, so reads stay correct
//! under paused-time tests where moka's own clock does not move.

use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::ops::compute::{CompResult, Op};
use moka::Expiry;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::CacheBackend;
use crate::error::ServiceError;

pub const DEFAULT_MEMORY_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: impl Into<String>, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value: value.into(),
            ttl,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Expires an entry after the TTL it was last written with.
struct EntryTtl;

impl Expiry<String, MemoryEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &MemoryEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        entry.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &MemoryEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        entry.ttl
    }
}

/// In-memory backend implementing the same protocol as Redis.
pub struct MemoryCacheBackend {
    entries: MokaCache<String, MemoryEntry>,
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryCacheBackend {
    pub fn new(max_capacity: u64) -> Self {
        info!("Initializing memory cache backend with capacity: {}", max_capacity);

        let entries = MokaCache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryTtl)
            .build();

        Self { entries }
    }

    /// Entries held by the cache, including expired ones not yet evicted.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|(_, entry)| !entry.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry past its deadline and run moka's pending maintenance.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key)
            .collect();

        for key in &expired {
            self.evict_if_expired(key.as_str()).await;
        }
        self.entries.run_pending_tasks().await;

        if !expired.is_empty() {
            debug!("Memory backend purged {} expired entries", expired.len());
        }
    }

    async fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().is_expired(now) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
    }

    /// Atomically decide the fate of `key` from its live entry, if any.
    async fn compute<F>(&self, key: &str, decide: F) -> CompResult<String, MemoryEntry>
    where
        F: FnOnce(Option<MemoryEntry>, Instant) -> Op<MemoryEntry> + Send,
    {
        let now = Instant::now();
        self.entries
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let live = current
                    .map(|entry| entry.into_value())
                    .filter(|entry| !entry.is_expired(now));
                std::future::ready(decide(live, now))
            })
            .await
    }
}

/// Translate a Redis glob into an anchored regex.
///
/// Supports `*`, `?`, `[...]` classes (with `^` negation and `a-z` ranges) and `\` escapes.
fn glob_to_regex(pattern: &str) -> Result<Regex, ServiceError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                translated.push_str(&regex::escape(&chars[i].to_string()));
            }
            '[' => match char_class(&chars[i + 1..]) {
                Some((class, consumed)) => {
                    translated.push_str(&class);
                    i += consumed;
                }
                None => translated.push_str(r"\["),
            },
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }
    translated.push('$');

    Regex::new(&translated).map_err(|e| {
        ServiceError::ValidationError(format!("Invalid key pattern '{}': {}", pattern, e))
    })
}

/// Parse the body of a `[...]` class. Returns the regex class and how many chars it used,
/// or `None` when the class is never closed.
fn char_class(rest: &[char]) -> Option<(String, usize)> {
    let mut class = String::from("[");
    let mut i = 0;
    if rest.first() == Some(&'^') {
        class.push('^');
        i = 1;
    }
    let start = i;

    while i < rest.len() {
        match rest[i] {
            ']' if i > start => {
                class.push(']');
                return Some((class, i + 1));
            }
            '\\' if i + 1 < rest.len() => {
                i += 1;
                class.push_str(&regex::escape(&rest[i].to_string()));
            }
            '-' if i > start && i + 1 < rest.len() && rest[i + 1] != ']' => class.push('-'),
            other => class.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }
    None
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError> {
        match self.entries.get(key).await {
            Some(entry) if entry.is_expired(Instant::now()) => {
                self.evict_if_expired(key).await;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ServiceError> {
        self.entries
            .insert(key.to_string(), MemoryEntry::new(value, ttl, Instant::now()))
            .await;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        let result = self
            .compute(key, |live, now| match live {
                Some(_) => Op::Nop,
                None => Op::Put(MemoryEntry::new(value, Some(ttl), now)),
            })
            .await;
        Ok(matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_)))
    }

    async fn del(&self, keys: &[String]) -> Result<u64, ServiceError> {
        let mut removed = 0u64;
        for key in keys {
            let result = self
                .compute(key, |live, _| if live.is_some() { Op::Remove } else { Op::Nop })
                .await;
            if matches!(result, CompResult::Removed(_)) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, ServiceError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, ServiceError> {
        let matcher = glob_to_regex(pattern)?;
        self.purge_expired().await;

        let now = Instant::now();
        let mut matched: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && matcher.is_match(key))
            .map(|(key, _)| key.to_string())
            .collect();
        matched.sort();
        debug!("Memory backend matched {} keys for pattern {}", matched.len(), pattern);
        Ok(matched)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ServiceError> {
        let result = self
            .compute(key, |live, now| match live {
                Some(entry) => Op::Put(MemoryEntry::new(entry.value, Some(ttl), now)),
                None => Op::Nop,
            })
            .await;
        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, ServiceError> {
        let result = self
            .compute(key, |live, _| match live {
                Some(entry) if entry.value == expected => Op::Remove,
                _ => Op::Nop,
            })
            .await;
        Ok(matches!(result, CompResult::Removed(_)))
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        let result = self
            .compute(key, |live, now| match live {
                Some(entry) if entry.value == expected => {
                    Op::Put(MemoryEntry::new(entry.value, Some(ttl), now))
                }
                _ => Op::Nop,
            })
            .await;
        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let backend = MemoryCacheBackend::default();
        backend.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        backend.set("forever", "v", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
        assert!(backend.exists("forever").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_released_from_memory() {
        let backend = MemoryCacheBackend::default();
        for i in 0..10_000 {
            backend
                .set(&format!("record:{}", i), "v", Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        backend.set("kept", "v", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        backend.purge_expired().await;

        assert_eq!(backend.len(), 1);
        assert_eq!(backend.entry_count(), 1);
    }

    #[tokio::test]
    async fn ttl_eviction_runs_on_the_wall_clock() {
        let backend = MemoryCacheBackend::default();
        for i in 0..100 {
            backend
                .set(&format!("record:{}", i), "v", Some(Duration::from_millis(20)))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        backend.purge_expired().await;
        assert_eq!(backend.entry_count(), 0);
    }

    #[tokio::test]
    async fn capacity_bounds_the_number_of_entries() {
        let backend = MemoryCacheBackend::new(50);
        for i in 0..500 {
            backend.set(&format!("record:{}", i), "v", None).await.unwrap();
        }

        backend.purge_expired().await;
        assert!(backend.entry_count() <= 50);
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_live_and_expired_entries() {
        let backend = MemoryCacheBackend::default();
        assert!(backend.set_if_absent("lock", "a1", Duration::from_secs(5)).await.unwrap());
        assert!(!backend.set_if_absent("lock", "b1", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend.set_if_absent("lock", "b1", Duration::from_secs(5)).await.unwrap());
        assert_eq!(backend.get("lock").await.unwrap().as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn delete_if_equals_only_removes_matching_value() {
        let backend = MemoryCacheBackend::default();
        backend.set("lock", "b1", None).await.unwrap();

        assert!(!backend.delete_if_equals("lock", "a1").await.unwrap());
        assert!(backend.exists("lock").await.unwrap());
        assert!(backend.delete_if_equals("lock", "b1").await.unwrap());
        assert!(!backend.exists("lock").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_if_equals_extends_only_for_owner() {
        let backend = MemoryCacheBackend::default();
        backend.set("lock", "a1", Some(Duration::from_secs(5))).await.unwrap();

        assert!(!backend.expire_if_equals("lock", "b1", Duration::from_secs(60)).await.unwrap());
        assert!(backend.expire_if_equals("lock", "a1", Duration::from_secs(60)).await.unwrap());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(backend.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn keys_match_globs() {
        let backend = MemoryCacheBackend::default();
        let keys = [
            "p:users:profile:1",
            "p:users:profile:2",
            "p:users:plan:1",
            "p:content:profile:1",
            "p:users:profile.x",
        ];
        for key in keys {
            backend.set(key, "v", None).await.unwrap();
        }

        let matched = backend.keys("p:users:profile:*").await.unwrap();
        assert_eq!(
            matched,
            vec!["p:users:profile:1".to_string(), "p:users:profile:2".to_string()]
        );

        let single = backend.keys("p:users:p?an:1").await.unwrap();
        assert_eq!(single, vec!["p:users:plan:1".to_string()]);

        let removed = backend.del(&matched).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.len(), 3);
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let matcher = glob_to_regex("a.b+*").unwrap();
        assert!(matcher.is_match("a.b+anything"));
        assert!(!matcher.is_match("axb+anything"));
    }

    #[test]
    fn glob_supports_classes_and_escapes() {
        let class = glob_to_regex("user:[12]").unwrap();
        assert!(class.is_match("user:1"));
        assert!(class.is_match("user:2"));
        assert!(!class.is_match("user:3"));

        let negated = glob_to_regex("user:[^1]").unwrap();
        assert!(negated.is_match("user:3"));
        assert!(!negated.is_match("user:1"));

        let range = glob_to_regex("h[a-c]llo").unwrap();
        assert!(range.is_match("hbllo"));
        assert!(!range.is_match("hdllo"));

        let escaped = glob_to_regex(r"literal\*").unwrap();
        assert!(escaped.is_match("literal*"));
        assert!(!escaped.is_match("literally"));

        let unclosed = glob_to_regex("a[b").unwrap();
        assert!(unclosed.is_match("a[b"));
    }
}
