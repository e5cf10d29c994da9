//! # Circuit Breaker Module
//!
//! A per-plugin three-state gate consulted before every outbound call.
//! Breakers keep a misbehaving plugin from dragging the whole media server
//! down: after a failure pattern is detected the breaker opens, calls are
//! refused immediately, and the plugin gets a recovery window before probe
//! traffic is allowed again.
//!
//! ## States
//!
//! - **Closed** — normal operation; failures are counted.
//! - **Open** — calls are refused without touching the plugin. After the
//!   recovery timeout the breaker moves to half-open.
//! - **Half-Open** — a limited number of probe calls are allowed. Reaching
//!   the success threshold closes the breaker; any failure reopens it.
//!
//! ## Opening conditions
//!
//! The breaker opens from closed when either
//! - consecutive failures reach `failure_threshold`, or
//! - the sliding window holds at least `min_requests` outcomes inside
//!   `window_duration` and the failure rate is at least
//!   `window_failure_rate`.
//!
//! The second rule catches plugins that fail often without ever failing
//! `failure_threshold` times in a row.
//!
//! ## Accounting contract
//!
//! The breaker only sees outcomes the facade explicitly records. Calls the
//! breaker refused are never recorded, and `not_implemented` answers never
//! reach it — both rules live in the caller (see
//! [`crate::error::RuntimeError::counts_as_failure`]).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Circuit breaker operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,
    /// Failure detected - requests are blocked
    Open,
    /// Testing recovery - limited requests allowed
    HalfOpen,
}

/// Configuration for circuit breaker behavior. All knobs are per plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before testing whether the plugin has recovered
    #[serde(with = "crate::duration_serde")]
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close the circuit
    pub success_threshold: u32,
    /// Per-call deadline applied by the facade on gated requests
    #[serde(with = "crate::duration_serde")]
    pub request_timeout: Duration,
    /// Number of outcomes kept in the sliding window
    pub sliding_window_size: usize,
    /// Minimum windowed outcomes before the failure-rate rule applies
    pub min_requests: u32,
    /// Windowed failure rate at which the circuit opens
    pub window_failure_rate: f64,
    /// Outcomes older than this are ignored by the failure-rate rule
    #[serde(with = "crate::duration_serde")]
    pub window_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 3,
            request_timeout: Duration::from_secs(10),
            sliding_window_size: 20,
            min_requests: 10,
            window_failure_rate: 0.50,
            window_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// One recorded outcome in the sliding window.
#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: Instant,
    success: bool,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition: Instant,
    window: VecDeque<Outcome>,
    half_open_calls: u32,
    blocked_total: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_transition: Instant::now(),
            window: VecDeque::new(),
            half_open_calls: 0,
            blocked_total: 0,
        }
    }
}

/// Per-plugin three-state request gate.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BreakerState::new()),
            name: name.into(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Gate check; called before every outbound call.
    ///
    /// A `false` answer means the caller must not invoke the plugin and
    /// must not record a failure for the refusal.
    pub async fn allow_request(&self) -> bool {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if state.last_transition.elapsed() >= self.config.recovery_timeout {
                    state.state = CircuitState::HalfOpen;
                    state.last_transition = Instant::now();
                    state.half_open_calls = 1;
                    state.consecutive_successes = 0;
                    tracing::info!("circuit breaker {} transitioning to HALF-OPEN", self.name);
                    true
                } else {
                    state.blocked_total += 1;
                    tracing::warn!("circuit breaker {} is OPEN - blocking request", self.name);
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_calls < self.config.success_threshold {
                    state.half_open_calls += 1;
                    true
                } else {
                    state.blocked_total += 1;
                    false
                }
            }
        }
    }

    /// Record a successful outcome.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        let now = Instant::now();
        push_outcome(&mut state, &self.config, now, true);
        state.consecutive_failures = 0;
        state.consecutive_successes += 1;

        if state.state == CircuitState::HalfOpen
            && state.consecutive_successes >= self.config.success_threshold
        {
            state.state = CircuitState::Closed;
            state.last_transition = now;
            state.half_open_calls = 0;
            tracing::info!("circuit breaker {} transitioning to CLOSED", self.name);
        }
    }

    /// Record a failed outcome.
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        let now = Instant::now();
        push_outcome(&mut state, &self.config, now, false);
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;

        match state.state {
            CircuitState::Closed => {
                let consecutive_open =
                    state.consecutive_failures >= self.config.failure_threshold;
                let windowed_open = self.window_rate_exceeded(&state, now);
                if consecutive_open || windowed_open {
                    state.state = CircuitState::Open;
                    state.last_transition = now;
                    tracing::warn!(
                        "circuit breaker {} transitioning to OPEN after {} consecutive failures (windowed rule: {})",
                        self.name,
                        state.consecutive_failures,
                        windowed_open
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.last_transition = now;
                state.half_open_calls = 0;
                tracing::warn!("circuit breaker {} transitioning back to OPEN", self.name);
            }
            CircuitState::Open => {
                // A call admitted just before the transition can still
                // report its outcome here; nothing further to do.
            }
        }
    }

    fn window_rate_exceeded(&self, state: &BreakerState, now: Instant) -> bool {
        let fresh: Vec<&Outcome> = state
            .window
            .iter()
            .filter(|o| now.duration_since(o.at) <= self.config.window_duration)
            .collect();
        if (fresh.len() as u32) < self.config.min_requests {
            return false;
        }
        let failures = fresh.iter().filter(|o| !o.success).count();
        let rate = failures as f64 / fresh.len() as f64;
        rate >= self.config.window_failure_rate
    }

    /// Current state, transitioning out of `Open` only via [`allow_request`].
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    /// Snapshot of counters for operators and tests.
    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.read().await;
        let failures = state.window.iter().filter(|o| !o.success).count() as u64;
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            windowed_outcomes: state.window.len() as u64,
            windowed_failures: failures,
            blocked_total: state.blocked_total,
        }
    }

    /// Manually open the breaker.
    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        state.state = CircuitState::Open;
        state.last_transition = Instant::now();
        tracing::info!("circuit breaker {} manually forced to OPEN", self.name);
    }

    /// Manually close the breaker without clearing the window.
    pub async fn force_closed(&self) {
        let mut state = self.state.write().await;
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.half_open_calls = 0;
        state.last_transition = Instant::now();
        tracing::info!("circuit breaker {} manually forced to CLOSED", self.name);
    }

    /// Zero the windows and return to `Closed`; used when a plugin is
    /// unregistered and re-registered.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = BreakerState::new();
        tracing::info!("circuit breaker {} reset", self.name);
    }
}

fn push_outcome(
    state: &mut BreakerState,
    config: &CircuitBreakerConfig,
    now: Instant,
    success: bool,
) {
    state.window.push_back(Outcome { at: now, success });
    while state.window.len() > config.sliding_window_size {
        state.window.pop_front();
    }
}

/// Read-only breaker counters.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub windowed_outcomes: u64,
    pub windowed_failures: u64,
    pub blocked_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(100),
            success_threshold: 3,
            request_timeout: Duration::from_secs(1),
            sliding_window_size: 20,
            min_requests: 10,
            window_failure_rate: 0.50,
            window_duration: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn closed_breaker_allows_and_stays_closed_on_success() {
        let breaker = CircuitBreaker::new("test", quick_config());
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.allow_request().await);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn consecutive_failures_open_the_circuit() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for i in 0..5 {
            assert!(breaker.allow_request().await, "call {i} should be allowed");
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Refusals are not failures; the blocked counter moves instead.
        assert!(!breaker.allow_request().await);
        assert!(!breaker.allow_request().await);
        let metrics = breaker.metrics().await;
        assert_eq!(metrics.blocked_total, 2);
        assert_eq!(metrics.windowed_failures, 5);
    }

    #[tokio::test]
    async fn windowed_failure_rate_opens_without_a_streak() {
        let breaker = CircuitBreaker::new("test", quick_config());
        // Alternate success/failure: consecutive failures never exceed 1.
        // Nine outcomes stay under min_requests; the tenth (a failure)
        // brings the windowed rate to exactly 50% and trips the rule.
        for i in 0..9 {
            if i % 2 == 0 {
                breaker.record_success().await;
            } else {
                breaker.record_failure().await;
            }
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn recovery_needs_the_success_threshold() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..5 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.allow_request().await);

        tokio::time::sleep(Duration::from_millis(150)).await;

        // First allowed probe flips to half-open.
        assert!(breaker.allow_request().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        assert!(breaker.allow_request().await);
        breaker.record_success().await;
        assert!(breaker.allow_request().await);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..5 {
            breaker.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.allow_request().await);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.allow_request().await);
    }

    #[tokio::test]
    async fn reset_returns_to_a_clean_closed_state() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..5 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        let metrics = breaker.metrics().await;
        assert_eq!(metrics.windowed_outcomes, 0);
        assert_eq!(metrics.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn window_is_bounded_fifo() {
        let mut config = quick_config();
        config.sliding_window_size = 4;
        config.min_requests = 100; // keep the rate rule out of the way
        let breaker = CircuitBreaker::new("test", config);
        for _ in 0..10 {
            breaker.record_success().await;
        }
        assert_eq!(breaker.metrics().await.windowed_outcomes, 4);
    }
}
