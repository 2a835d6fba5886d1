//! ServiceCache integration tests

mod common;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use common::flaky_registry;
use tessera_core::cache::{CacheKey, CacheRegistry, CircuitPhase};
use tessera_core::config::BreakerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    plan: String,
}

fn breaker(threshold: u32, cooldown_secs: u64) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: threshold,
        cooldown: Duration::from_secs(cooldown_secs),
    }
}

#[tokio::test]
async fn set_then_get_returns_value() {
    let registry = CacheRegistry::in_memory("test:").unwrap();
    let cache = registry.service("users");
    let key = CacheKey::new("profile", "42");
    let profile = Profile {
        name: "Ada".to_string(),
        plan: "pro".to_string(),
    };

    assert!(cache.set(&key, &profile, Some(Duration::from_secs(60))).await);
    assert_eq!(cache.get::<Profile>(&key).await, Some(profile));
    assert!(cache.exists(&key).await);

    assert!(cache.del(&key).await);
    assert!(!cache.del(&key).await);
    assert_eq!(cache.get::<Profile>(&key).await, None);
}

#[derive(Debug, PartialEq, Deserialize)]
struct PlanSummary {
    plan: String,
}

#[tokio::test]
async fn get_decodes_read_only_types() {
    let registry = CacheRegistry::in_memory("test:").unwrap();
    let cache = registry.service("users");
    let key = CacheKey::new("profile", "9");

    assert!(cache.set_raw(&key, r#"{"name":"Lin","plan":"team"}"#, None).await);
    assert_eq!(
        cache.get::<PlanSummary>(&key).await,
        Some(PlanSummary {
            plan: "team".to_string()
        })
    );
}

#[tokio::test]
async fn undecodable_entry_is_a_miss_not_a_failure() {
    let registry = CacheRegistry::in_memory("test:").unwrap();
    let cache = registry.service("users");
    let key = CacheKey::new("profile", "7");

    assert!(cache.set_raw(&key, "not json", None).await);
    assert_eq!(cache.get::<Profile>(&key).await, None);
    assert_eq!(cache.circuit_state().failure_count, 0);
}

#[tokio::test]
async fn typed_namespace_and_pattern_delete() {
    let registry = CacheRegistry::in_memory("test:").unwrap();
    let cache = registry.service("content");
    let posts = cache.namespace::<Profile>("post");
    let other = registry.service("users");
    other.set_raw(&CacheKey::new("post", "1"), "keep", None).await;

    for id in ["1", "2", "3"] {
        let value = Profile {
            name: id.to_string(),
            plan: "free".to_string(),
        };
        assert!(posts.set(id, &value, None).await);
    }
    cache.set_raw(&CacheKey::new("draft", "1"), "x", None).await;

    assert_eq!(posts.clear().await, 3);
    assert!(!posts.exists("1").await);
    assert!(cache.exists(&CacheKey::new("draft", "1")).await);
    assert_eq!(
        other.get_raw(&CacheKey::new("post", "1")).await.as_deref(),
        Some("keep")
    );
}

#[tokio::test]
async fn oversized_values_and_keys_are_rejected_without_backend_failure() {
    let registry = CacheRegistry::in_memory("test:").unwrap();
    let cache = registry.service("users");

    let long_id = "k".repeat(600);
    assert!(!cache.set_raw(&CacheKey::new("profile", long_id), "v", None).await);

    let big = "v".repeat(2 * 1024 * 1024);
    assert!(!cache.set_raw(&CacheKey::new("profile", "big"), &big, None).await);
    assert_eq!(cache.circuit_state().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn circuit_opens_after_threshold_and_skips_backend() {
    let (registry, backend) = flaky_registry(breaker(3, 30));
    let cache = registry.service("subscriptions");
    let key = CacheKey::new("plan", "1");
    backend.set_failing(true);

    for _ in 0..3 {
        assert_eq!(cache.get_raw(&key).await, None);
    }
    assert_eq!(backend.calls(), 3);
    assert!(cache.circuit_state().is_open);

    // Within the cooldown nothing reaches the backend.
    for _ in 0..10 {
        assert_eq!(cache.get_raw(&key).await, None);
        assert!(!cache.set_raw(&key, "v", None).await);
    }
    assert_eq!(backend.calls(), 3);
    assert_eq!(cache.stats().short_circuits, 20);
}

#[tokio::test(start_paused = true)]
async fn trial_after_cooldown_closes_circuit() {
    let (registry, backend) = flaky_registry(breaker(2, 30));
    let cache = registry.service("auth");
    let key = CacheKey::new("session", "s1");

    backend.set_failing(true);
    cache.get_raw(&key).await;
    cache.get_raw(&key).await;
    assert_eq!(cache.circuit_state().phase, CircuitPhase::Open);

    backend.set_failing(false);
    tokio::time::advance(Duration::from_secs(31)).await;

    assert!(cache.set_raw(&key, "token", None).await);
    assert_eq!(cache.circuit_state().phase, CircuitPhase::Closed);
    assert_eq!(cache.get_raw(&key).await.as_deref(), Some("token"));
    assert_eq!(cache.circuit_state().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_trial_reopens_circuit() {
    let (registry, backend) = flaky_registry(breaker(1, 10));
    let cache = registry.service("auth");
    let key = CacheKey::new("session", "s1");
    backend.set_failing(true);

    cache.get_raw(&key).await;
    assert_eq!(backend.calls(), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    cache.get_raw(&key).await;
    assert_eq!(backend.calls(), 2);
    assert_eq!(cache.circuit_state().phase, CircuitPhase::Open);

    cache.get_raw(&key).await;
    assert_eq!(backend.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn half_open_lets_one_concurrent_call_through() {
    let (registry, backend) = flaky_registry(breaker(1, 30));
    let cache = registry.service("auth");
    let key = CacheKey::new("session", "s1");

    backend.set_failing(true);
    cache.get_raw(&key).await;
    assert_eq!(cache.circuit_state().phase, CircuitPhase::Open);
    let before = backend.calls();

    backend.set_failing(false);
    backend.set_delay(Duration::from_millis(500));
    tokio::time::advance(Duration::from_secs(31)).await;

    let callers = (0..8).map(|_| {
        let cache = cache.clone();
        let key = key.clone();
        async move { cache.get_raw(&key).await }
    });
    let results = futures::future::join_all(callers).await;

    assert!(results.iter().all(Option::is_none));
    assert_eq!(backend.calls(), before + 1);
    assert_eq!(cache.circuit_state().phase, CircuitPhase::Closed);
    assert_eq!(cache.stats().short_circuits, 7);

    cache.get_raw(&key).await;
    assert_eq!(backend.calls(), before + 2);
}

#[tokio::test]
async fn one_service_outage_does_not_open_another_circuit() {
    let (registry, backend) = flaky_registry(breaker(1, 30));
    let users = registry.service("users");
    backend.set_failing(true);
    users.get_raw(&CacheKey::new("profile", "1")).await;
    backend.set_failing(false);

    let content = registry.service("content");
    assert!(content.set_raw(&CacheKey::new("post", "1"), "hello", None).await);
    assert!(users.circuit_state().is_open);
    assert!(!content.circuit_state().is_open);

    let health = registry.health();
    assert_eq!(health.len(), 2);
    assert_eq!(health[0].service, "content");
    assert_eq!(health[1].phase, CircuitPhase::Open);
}
