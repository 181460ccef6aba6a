//! Circuit breaker guarding calls into the document store.
//!
//! After `failure_threshold` consecutive failures the circuit opens and calls
//! are refused without touching the store. Once `reset_timeout` has passed a
//! single trial call is let through (half-open); further calls are refused until
//! that call reports back, or until it has been outstanding for another
//! `reset_timeout`. `success_threshold` successes close the circuit again, any
//! failure reopens it.

use crate::config::CircuitBreakerSettings;
use crate::error::StoreError;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are refused
    Open,
    /// A single trial call passes through
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge value: 0 closed, 1 half-open, 2 open.
    pub fn as_gauge(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name for logging
    pub name: String,

    /// Consecutive failures before opening
    pub failure_threshold: u32,

    /// Time spent open before a trial call is allowed
    pub reset_timeout: Duration,

    /// Half-open successes needed to close
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    /// Create a configuration with default thresholds.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }

    /// Build from the `[circuit_breaker]` config section.
    pub fn from_settings(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self::new(name)
            .with_failure_threshold(settings.failure_threshold)
            .with_reset_timeout(Duration::from_secs(settings.reset_timeout_seconds))
            .with_success_threshold(settings.success_threshold)
    }

    /// Set failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set success threshold.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new("store")
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The call was refused without being attempted
    #[error("Circuit breaker is open")]
    Open,

    /// The call ran and failed
    #[error("Service error: {0}")]
    Service(#[source] E),
}

impl From<CircuitBreakerError<StoreError>> for StoreError {
    fn from(err: CircuitBreakerError<StoreError>) -> Self {
        match err {
            CircuitBreakerError::Open => StoreError::CircuitOpen,
            CircuitBreakerError::Service(e) => e,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures recorded
    pub consecutive_failures: u32,
    /// Calls refused while open
    pub rejected_calls: u64,
    /// Number of times the circuit opened
    pub times_opened: u64,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

impl Inner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            trial_started: None,
        }
    }
}

/// Circuit breaker for store calls.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    rejected_calls: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "Circuit breaker created"
        );
        Self {
            config,
            inner: Mutex::new(Inner::closed()),
            rejected_calls: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    /// Whether a call may proceed now. Moves an expired open circuit to
    /// half-open. While half-open only one trial call is admitted at a time; a
    /// caller that gets `true` must report with `record_success` or
    /// `record_failure`.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                // A trial call that never reported back (cancelled caller) stops
                // blocking after one reset_timeout.
                let free = inner
                    .trial_started
                    .map(|at| now.saturating_duration_since(at) >= self.config.reset_timeout)
                    .unwrap_or(true);
                if free {
                    inner.trial_started = Some(now);
                }
                free
            }
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map(|at| now.saturating_duration_since(at) >= self.config.reset_timeout)
                    .unwrap_or(true);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.trial_started = Some(now);
                    info!(name = %self.config.name, "Circuit breaker half-open, admitting a trial call");
                }
                expired
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::Open => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.trial_started = None;
                inner.half_open_successes += 1;
                debug!(
                    name = %self.config.name,
                    successes = inner.half_open_successes,
                    threshold = self.config.success_threshold,
                    "Half-open trial call succeeded"
                );
                if inner.half_open_successes >= self.config.success_threshold {
                    *inner = Inner::closed();
                    info!(name = %self.config.name, "Circuit breaker closed");
                }
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;

        let should_open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            let from = inner.state;
            inner.state = CircuitState::Open;
            inner.half_open_successes = 0;
            inner.trial_started = None;
            inner.opened_at = Some(Instant::now());
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            warn!(
                name = %self.config.name,
                from = from.as_str(),
                failures = inner.consecutive_failures,
                "Circuit breaker opened"
            );
        } else {
            debug!(
                name = %self.config.name,
                failures = inner.consecutive_failures,
                threshold = self.config.failure_threshold,
                "Circuit breaker recorded failure"
            );
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures recorded.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::closed();
        info!(name = %self.config.name, "Circuit breaker reset");
    }

    /// Snapshot for metrics and health.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }

    /// Run `op` if the circuit allows it, recording the outcome.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.is_allowed() {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return Err(CircuitBreakerError::Open);
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Service(e))
            }
        }
    }

    /// Run `op`, substituting `fallback` for a refused or failed call.
    pub async fn execute_with_fallback<F, Fut, T, E, G>(&self, op: F, fallback: G) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(CircuitBreakerError<E>) -> T,
    {
        match self.execute(op).await {
            Ok(value) => value,
            Err(err) => fallback(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new("test")
                .with_failure_threshold(failures)
                .with_reset_timeout(Duration::from_millis(reset_ms))
                .with_success_threshold(2),
        )
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.name(), "store");
        assert!(cb.is_allowed());
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 1_000);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_allowed());
        assert_eq!(cb.stats().times_opened, 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(3, 1_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_then_closed() {
        let cb = breaker(2, 10);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_allowed());

        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_one_trial_call_at_a_time() {
        let cb = breaker(1, 20);
        cb.record_failure();

        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.is_allowed());
        assert!(!cb.is_allowed());
        assert!(!cb.is_allowed());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_allowed());
        assert!(!cb.is_allowed());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());
        assert!(cb.is_allowed());
    }

    #[test]
    fn test_abandoned_trial_call_frees_slot_after_timeout() {
        let cb = breaker(1, 20);
        cb.record_failure();

        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.is_allowed());
        assert!(!cb.is_allowed());

        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.is_allowed());
    }

    #[tokio::test]
    async fn test_half_open_rejects_concurrent_calls() {
        let cb = breaker(1, 20);
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(25)).await;

        let slow = cb.execute(|| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, StoreError>(1)
        });
        let fast = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cb.execute(|| async { Ok::<_, StoreError>(2) }).await
        };
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow.unwrap(), 1);
        assert!(matches!(fast, Err(CircuitBreakerError::Open)));
        assert_eq!(cb.stats().rejected_calls, 1);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(2, 10);
        cb.record_failure();
        cb.record_failure();

        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().times_opened, 2);
    }

    #[test]
    fn test_reset() {
        let cb = breaker(1, 1_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());
    }

    #[test]
    fn test_from_settings() {
        let settings = CircuitBreakerSettings {
            failure_threshold: 7,
            reset_timeout_seconds: 3,
            success_threshold: 1,
        };
        let config = CircuitBreakerConfig::from_settings("store", &settings);
        assert_eq!(config.failure_threshold, 7);
        assert_eq!(config.reset_timeout, Duration::from_secs(3));
        assert_eq!(config.success_threshold, 1);
    }

    #[tokio::test]
    async fn test_execute_records_outcomes() {
        let cb = breaker(2, 1_000);

        let ok: Result<i32, CircuitBreakerError<StoreError>> = cb.execute(|| async { Ok(42) }).await;
        assert_eq!(ok.unwrap(), 42);

        for _ in 0..2 {
            let res: Result<i32, _> = cb
                .execute(|| async { Err(StoreError::Unavailable("down".into())) })
                .await;
            assert!(matches!(res, Err(CircuitBreakerError::Service(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let refused: Result<i32, CircuitBreakerError<StoreError>> =
            cb.execute(|| async { Ok(1) }).await;
        assert!(matches!(refused, Err(CircuitBreakerError::Open)));
        assert_eq!(cb.stats().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_execute_with_fallback() {
        let cb = breaker(1, 1_000);

        let value = cb
            .execute_with_fallback(|| async { Ok::<_, StoreError>(true) }, |_| false)
            .await;
        assert!(value);

        let value = cb
            .execute_with_fallback(
                || async { Err::<bool, _>(StoreError::Unavailable("down".into())) },
                |err| {
                    assert!(matches!(err, CircuitBreakerError::Service(_)));
                    false
                },
            )
            .await;
        assert!(!value);

        let mut ran = false;
        let value = cb
            .execute_with_fallback(
                || {
                    ran = true;
                    async { Ok::<_, StoreError>(true) }
                },
                |err| {
                    assert!(matches!(err, CircuitBreakerError::Open));
                    false
                },
            )
            .await;
        assert!(!value);
        assert!(!ran);
    }

    #[test]
    fn test_error_into_store_error() {
        let err: StoreError = CircuitBreakerError::<StoreError>::Open.into();
        assert_eq!(err, StoreError::CircuitOpen);

        let err: StoreError =
            CircuitBreakerError::Service(StoreError::Timeout(Duration::from_secs(1))).into();
        assert_eq!(err, StoreError::Timeout(Duration::from_secs(1)));
    }
}
