//! Circuit breaker.
//!
//! Closed counts failures inside a rolling window; at the threshold the
//! circuit opens and calls fail fast with the remaining cool-down. After
//! `recovery_timeout` a bounded number of half-open probes run; enough
//! successes close the circuit, any probe failure re-opens it.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Circuit thresholds and windows.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(10),
            half_open_max_calls: 2,
            half_open_success_threshold: 2,
        }
    }
}

/// Observable state of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    window_start: Instant,
    open_until: Option<Instant>,
    probes_in_flight: u32,
    half_open_successes: u32,
}

/// Point-in-time view for metrics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub open_remaining: Option<Duration>,
}

/// Why a call was denied.
#[derive(Debug, Clone, Copy)]
pub struct CircuitRejection {
    pub retry_after: Duration,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                window_start: Instant::now(),
                open_until: None,
                probes_in_flight: 0,
                half_open_successes: 0,
            }),
            config,
        }
    }

    /// Ask to place a call. `Ok` admits it (and, in half-open, reserves a
    /// probe slot); the caller must follow up with exactly one
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn admit(&self) -> Result<(), CircuitRejection> {
        let mut inner = self.inner.lock().expect("circuit lock");
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let until = inner.open_until.unwrap_or(now);
                if now >= until {
                    debug!("circuit half-open; admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 1;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(CircuitRejection {
                        retry_after: until - now,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_calls {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(CircuitRejection {
                        retry_after: self.config.recovery_timeout,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit lock");
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    debug!("circuit closed after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.open_until = None;
                    inner.probes_in_flight = 0;
                    inner.half_open_successes = 0;
                    inner.window_start = Instant::now();
                }
            }
            // A success while open has no slot to release.
            CircuitState::Open => {}
        }
    }

    /// Release an admitted slot without scoring an outcome (aborted call).
    pub fn record_cancelled(&self) {
        let mut inner = self.inner.lock().expect("circuit lock");
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit lock");
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                if now.duration_since(inner.window_start) > self.config.failure_window {
                    inner.window_start = now;
                    inner.failure_count = 0;
                }
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    debug!(
                        failures = inner.failure_count,
                        "failure threshold reached; opening circuit"
                    );
                    inner.state = CircuitState::Open;
                    inner.open_until = Some(now + self.config.recovery_timeout);
                }
            }
            CircuitState::HalfOpen => {
                debug!("probe failed; re-opening circuit");
                inner.state = CircuitState::Open;
                inner.open_until = Some(now + self.config.recovery_timeout);
                inner.probes_in_flight = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().expect("circuit lock");
        let now = Instant::now();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            open_remaining: inner
                .open_until
                .and_then(|until| until.checked_duration_since(now)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            recovery_timeout: Duration::from_millis(50),
            half_open_max_calls: 2,
            half_open_success_threshold: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_reports_retry_after() {
        let cb = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            cb.admit().unwrap();
            cb.record_failure();
        }
        assert_eq!(cb.snapshot().state, CircuitState::Open);

        let rejection = cb.admit().unwrap_err();
        assert!(rejection.retry_after > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_through_half_open() {
        let cb = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            cb.admit().unwrap();
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_millis(60)).await;

        // Two successful probes close the circuit.
        cb.admit().unwrap();
        cb.record_success();
        cb.admit().unwrap();
        cb.record_success();

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.open_remaining, None);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens() {
        let cb = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            cb.admit().unwrap();
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_millis(60)).await;

        cb.admit().unwrap();
        cb.record_failure();
        assert_eq!(cb.snapshot().state, CircuitState::Open);
        assert!(cb.admit().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_bounds_probe_concurrency() {
        let cb = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            cb.admit().unwrap();
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_millis(60)).await;

        cb.admit().unwrap(); // probe 1 (transitions to half-open)
        cb.admit().unwrap(); // probe 2
        assert!(cb.admit().is_err(), "third concurrent probe denied");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_window_expiry_resets_count() {
        let cb = CircuitBreaker::new(quick_config());
        cb.admit().unwrap();
        cb.record_failure();
        cb.admit().unwrap();
        cb.record_failure();

        tokio::time::advance(Duration::from_secs(11)).await;
        cb.admit().unwrap();
        cb.record_failure(); // stale window: count restarts at 1
        assert_eq!(cb.snapshot().state, CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 1);
    }
}
