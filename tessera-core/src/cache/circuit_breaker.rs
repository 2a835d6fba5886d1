//! Per-service circuit breaker guarding the shared cache backend
//!
//! ```text
//! Closed   → Open      failure_count reaches the threshold
//! Open     → HalfOpen  cooldown elapsed; exactly one trial call is admitted
//! HalfOpen → Closed    trial succeeded (failure_count reset)
//! HalfOpen → Open      trial failed
//! ```
//!
//! A trial that never reports back (its task was cancelled) is replaced by a new trial after
//! another cooldown, so the breaker cannot wedge in `HalfOpen`.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitPhase::Closed => "closed",
            CircuitPhase::Open => "open",
            CircuitPhase::HalfOpen => "half_open",
        }
    }
}

/// Snapshot of one service's breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitState {
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub is_open: bool,
    pub phase: CircuitPhase,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

impl CircuitState {
    fn closed() -> Self {
        Self {
            failure_count: 0,
            last_failure_at: None,
            is_open: false,
            phase: CircuitPhase::Closed,
            opened_at: None,
            trial_started_at: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.phase = CircuitPhase::Open;
        self.is_open = true;
        self.opened_at = Some(now);
        self.trial_started_at = None;
    }
}

/// Outcome of asking the breaker whether a call may reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call normally.
    Allowed,
    /// Cooldown elapsed; this call is the single trial.
    Trial,
    /// Circuit open; do not touch the backend.
    Rejected,
}

impl Admission {
    pub fn is_permitted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(CircuitState::closed()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Decide whether the next call may reach the backend.
    pub fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut state = self.lock_state();

        match state.phase {
            CircuitPhase::Closed => Admission::Allowed,
            CircuitPhase::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                if now.duration_since(opened_at) >= self.config.cooldown {
                    state.phase = CircuitPhase::HalfOpen;
                    state.trial_started_at = Some(now);
                    info!(service = %self.service, "Cache circuit half-open, admitting trial call");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitPhase::HalfOpen => {
                let started = state.trial_started_at.unwrap_or(now);
                if now.duration_since(started) >= self.config.cooldown {
                    state.trial_started_at = Some(now);
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful backend call. Returns true if this closed the circuit.
    ///
    /// Only a success in `HalfOpen` closes an open circuit. A call admitted before the circuit
    /// opened that completes afterwards leaves it open.
    pub fn record_success(&self) -> bool {
        let mut state = self.lock_state();
        match state.phase {
            CircuitPhase::Closed => {
                state.failure_count = 0;
                false
            }
            CircuitPhase::HalfOpen => {
                *state = CircuitState::closed();
                info!(service = %self.service, "Cache circuit closed after successful trial");
                true
            }
            CircuitPhase::Open => false,
        }
    }

    /// Record a failed backend call. Returns true if this opened the circuit.
    pub fn record_failure(&self) -> bool {
        let now = Instant::now();
        let mut state = self.lock_state();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(now);

        match state.phase {
            CircuitPhase::Closed if state.failure_count >= self.config.failure_threshold => {
                state.open(now);
                warn!(
                    service = %self.service,
                    failures = state.failure_count,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Cache circuit opened"
                );
                true
            }
            CircuitPhase::HalfOpen => {
                state.open(now);
                warn!(service = %self.service, "Cache circuit trial failed, re-opened");
                true
            }
            _ => false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock_state().clone()
    }

    pub fn phase(&self) -> CircuitPhase {
        self.lock_state().phase
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        // The state is plain data; a panic while holding the guard cannot leave it torn.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "users",
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker();

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.admit(), Admission::Allowed);
        assert!(breaker.record_failure());

        let state = breaker.state();
        assert!(state.is_open);
        assert_eq!(state.failure_count, 3);
        assert!(state.last_failure_at.is_some());
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_count() {
        let breaker = breaker();

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.phase(), CircuitPhase::Closed);
        assert_eq!(breaker.state().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_trial() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.admit(), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.admit(), Admission::Trial);
        assert_eq!(breaker.phase(), CircuitPhase::HalfOpen);
        assert_eq!(breaker.admit(), Admission::Rejected);

        assert!(breaker.record_success());
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_for_another_cooldown() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.admit(), Admission::Trial);

        assert!(breaker.record_failure());
        assert_eq!(breaker.phase(), CircuitPhase::Open);
        assert_eq!(breaker.admit(), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.admit(), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_does_not_close_open_circuit() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }

        assert!(!breaker.record_success());
        assert_eq!(breaker.phase(), CircuitPhase::Open);
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_is_replaced_after_cooldown() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.admit(), Admission::Trial);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.admit(), Admission::Trial);
    }
}
