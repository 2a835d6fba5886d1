//! Retry policy: bounded exponential backoff with random jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::ServiceError;

/// Backoff policy passed explicitly to the components that retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Upper bound for any single delay, jitter included.
    pub max_delay: Duration,

    /// Fraction of the computed delay added as random jitter, in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 0.0)
    }

    /// Policy used for lock acquisition.
    pub fn lock_default() -> Self {
        Self::new(10, Duration::from_millis(50), Duration::from_millis(500), 0.5)
    }

    /// Policy used for transient mirror-store failures during sync.
    pub fn sync_default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_secs(2), 0.2)
    }

    /// Delay without jitter after `attempt` failed attempts (1-indexed).
    ///
    /// delay = base_delay * 2^(attempt - 1), capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay with jitter; never exceeds `max_delay`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let spread = backoff.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        (backoff + Duration::from_secs_f64(extra)).min(self.max_delay)
    }

    /// Worst-case total time spent waiting between attempts.
    pub fn max_total_wait(&self) -> Duration {
        self.max_delay * self.max_attempts.saturating_sub(1)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
    pub async fn retry_transient<T, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.next_delay(attempt);
                    debug!(
                        "{} failed on attempt {}: {}; retrying in {:?}",
                        operation, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::sync_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350), 0.0);

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(10), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1), 0.5);

        for _ in 0..200 {
            let delay = policy.next_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn attempts_are_at_least_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 2.0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.jitter, 1.0);
        assert_eq!(policy.max_total_wait(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_only_transient_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40), 0.0);

        let mut calls = 0;
        let result: Result<u32, ServiceError> = policy
            .retry_transient("flaky", || {
                calls += 1;
                let outcome = if calls < 3 {
                    Err(ServiceError::DatabaseError("reset".into()))
                } else {
                    Ok(calls)
                };
                async move { outcome }
            })
            .await;
        assert_eq!(result.unwrap(), 3);

        let mut calls = 0;
        let result: Result<(), ServiceError> = policy
            .retry_transient("invalid", || {
                calls += 1;
                async { Err(ServiceError::ValidationError("bad".into())) }
            })
            .await;
        assert!(matches!(result, Err(ServiceError::ValidationError(_))));
        assert_eq!(calls, 1);
    }
}
