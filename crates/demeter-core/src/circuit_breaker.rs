//! Circuit breaker protecting the upstream content platform.
//!
//! One instance per process, constructed at startup and injected into the
//! HTTP client. Only upstream overload signals count toward the failure
//! threshold; ordinary transient errors are handled by the retry layer.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N overloads]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                          |
//!                                        <--[overload]--                   |
//!                                                                          |
//! CLOSED <--------------------------[M successes]--------------------------+
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - limited probe requests test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of overload signals before opening the circuit.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub recovery_timeout: Duration,

    /// Maximum concurrent probe calls admitted while Half-Open.
    pub half_open_max_calls: u32,

    /// Successful probes required in Half-Open to close the circuit.
    pub half_open_success_threshold: u32,

    /// While Closed, a failure count older than this decays to zero.
    pub reset_timeout: Duration,

    /// Wait suggested to callers rejected because all probe slots are taken.
    pub probe_poll_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        // A single overload opens the circuit. Aggressive, but the platform
        // throttles whole client IPs once it starts shedding load.
        Self {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            half_open_success_threshold: 2,
            reset_timeout: Duration::from_secs(300),
            probe_poll_interval: Duration::from_millis(200),
        }
    }
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_probes: u32,
    half_open_successes: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_probes: 0,
            half_open_successes: 0,
            last_failure_time: None,
            opened_at: None,
        }
    }
}

/// Statistics snapshot for the observability surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStats {
    pub state: String,
    pub failure_count: u32,
    pub half_open_probes: u32,
    pub half_open_successes: u32,
    #[serde(skip)]
    pub remaining_recovery: Option<Duration>,
}

/// Thread-safe circuit breaker gating requests to the platform.
///
/// All mutation happens inside a single critical section: two racing
/// failures cannot both observe the threshold and double-transition.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner::new())),
        }
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned circuit breaker mutex");
            poisoned.into_inner()
        })
    }

    /// Gate a request through the breaker.
    ///
    /// - Closed: admitted (stale failure counts decay first).
    /// - Open before recovery: rejected with the remaining wait.
    /// - Open after recovery: transitions to Half-Open, then probes.
    /// - Half-Open: admitted as a probe while slots remain, else rejected.
    pub fn acquire(&self) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                if let Some(last) = inner.last_failure_time
                    && inner.failure_count > 0
                    && last.elapsed() >= self.config.reset_timeout
                {
                    tracing::debug!(
                        stale_failures = inner.failure_count,
                        "Decaying stale failure count"
                    );
                    inner.failure_count = 0;
                }
                Ok(())
            }
            CircuitState::Open => {
                let retry_after = self.remaining_recovery(&inner).unwrap_or(self.config.recovery_timeout);
                Err(AppError::CircuitOpen { retry_after })
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes >= self.config.half_open_max_calls {
                    Err(AppError::CircuitOpen {
                        retry_after: self.config.probe_poll_interval,
                    })
                } else {
                    inner.half_open_probes += 1;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call previously admitted by [`acquire`].
    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    tracing::info!(
                        probes = inner.half_open_successes,
                        "Circuit breaker closing after successful probes"
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_probes = 0;
                    inner.half_open_successes = 0;
                    inner.last_failure_time = None;
                    inner.opened_at = None;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call previously admitted by [`acquire`].
    ///
    /// Only `overload == true` counts toward the threshold; other failures
    /// merely release their Half-Open probe slot.
    pub fn record_failure(&self, overload: bool) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                if !overload {
                    return;
                }
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.failure_count,
                        "Circuit breaker opening after upstream overload"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
                if overload {
                    tracing::warn!("Probe hit overload, circuit breaker re-opening");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.last_failure_time = Some(Instant::now());
                    inner.half_open_probes = 0;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let remaining_recovery = if inner.state == CircuitState::Open {
            self.remaining_recovery(&inner)
        } else {
            None
        };

        CircuitBreakerStats {
            state: inner.state.to_string(),
            failure_count: inner.failure_count,
            half_open_probes: inner.half_open_probes,
            half_open_successes: inner.half_open_successes,
            remaining_recovery,
        }
    }

    fn remaining_recovery(&self, inner: &CircuitBreakerInner) -> Option<Duration> {
        inner.opened_at.map(|t| {
            let elapsed = t.elapsed();
            if elapsed < self.config.recovery_timeout {
                self.config.recovery_timeout - elapsed
            } else {
                Duration::ZERO
            }
        })
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened) = inner.opened_at
            && opened.elapsed() >= self.config.recovery_timeout
        {
            tracing::info!("Circuit breaker transitioning to half-open");
            inner.state = CircuitState::HalfOpen;
            inner.half_open_probes = 0;
            inner.half_open_successes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(20),
            half_open_max_calls: 1,
            half_open_success_threshold: 2,
            reset_timeout: Duration::from_secs(300),
            probe_poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.acquire().is_ok());
    }

    #[test]
    fn test_single_overload_opens_with_default_threshold() {
        let cb = CircuitBreaker::new(fast_config());
        cb.acquire().unwrap();
        cb.record_failure(true);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.acquire(),
            Err(AppError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_non_overload_failures_do_not_open() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..10 {
            cb.acquire().unwrap();
            cb.record_failure(false);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_stays_closed_below_threshold() {
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            ..fast_config()
        };
        let cb = CircuitBreaker::new(config);
        for _ in 0..4 {
            cb.acquire().unwrap();
            cb.record_failure(true);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            ..fast_config()
        };
        let cb = CircuitBreaker::new(config);
        for _ in 0..4 {
            cb.acquire().unwrap();
            cb.record_failure(true);
        }
        cb.acquire().unwrap();
        cb.record_success();
        for _ in 0..4 {
            cb.acquire().unwrap();
            cb.record_failure(true);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_reports_remaining_recovery() {
        let config = CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(60),
            ..fast_config()
        };
        let cb = CircuitBreaker::new(config);
        cb.acquire().unwrap();
        cb.record_failure(true);

        match cb.acquire() {
            Err(AppError::CircuitOpen { retry_after }) => {
                assert!(retry_after > Duration::from_secs(55));
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_transitions_to_half_open_after_recovery() {
        let cb = CircuitBreaker::new(fast_config());
        cb.acquire().unwrap();
        cb.record_failure(true);
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_limits_concurrent_probes() {
        let config = CircuitBreakerConfig {
            half_open_max_calls: 2,
            ..fast_config()
        };
        let cb = CircuitBreaker::new(config);
        cb.acquire().unwrap();
        cb.record_failure(true);
        std::thread::sleep(Duration::from_millis(30));

        assert!(cb.acquire().is_ok());
        assert!(cb.acquire().is_ok());
        // Third concurrent probe is rejected while the first two are in flight.
        assert!(matches!(cb.acquire(), Err(AppError::CircuitOpen { .. })));

        // A finished probe releases its slot.
        cb.record_success();
        assert!(cb.acquire().is_ok());
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new(fast_config());
        cb.acquire().unwrap();
        cb.record_failure(true);
        std::thread::sleep(Duration::from_millis(30));

        cb.acquire().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.acquire().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[test]
    fn test_half_open_reopens_on_overload() {
        let cb = CircuitBreaker::new(fast_config());
        cb.acquire().unwrap();
        cb.record_failure(true);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.acquire().unwrap();
        cb.record_failure(true);
        assert_eq!(cb.state(), CircuitState::Open);

        let stats = cb.stats();
        assert_eq!(stats.half_open_probes, 0);
        assert_eq!(stats.half_open_successes, 0);
    }

    #[test]
    fn test_half_open_transient_failure_releases_probe_without_reopening() {
        let cb = CircuitBreaker::new(fast_config());
        cb.acquire().unwrap();
        cb.record_failure(true);
        std::thread::sleep(Duration::from_millis(30));

        cb.acquire().unwrap();
        cb.record_failure(false);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.acquire().is_ok());
    }

    #[test]
    fn test_stale_failures_decay_while_closed() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(10),
            ..fast_config()
        };
        let cb = CircuitBreaker::new(config);
        cb.acquire().unwrap();
        cb.record_failure(true);
        cb.acquire().unwrap();
        cb.record_failure(true);
        assert_eq!(cb.stats().failure_count, 2);

        std::thread::sleep(Duration::from_millis(15));
        cb.acquire().unwrap();
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[test]
    fn test_concurrent_failures_single_transition() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            ..fast_config()
        };
        let cb = CircuitBreaker::new(config);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cb = cb.clone();
            handles.push(std::thread::spawn(move || {
                let _ = cb.acquire();
                cb.record_failure(true);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Racing failures must settle on exactly one Open state.
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
