//! Per-upstream circuit breaker.
//!
//! State transitions are evaluated lazily whenever the state is read or a
//! request asks for admission. Every `*_at` method takes the current instant
//! explicitly so tests can drive time; the plain variants use
//! `Instant::now()`.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ResilienceError;
use crate::retry::Classify;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open after the last failure
    pub recovery_timeout_ms: u64,
    /// Probe requests admitted while half-open
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Request rejected because the circuit is open.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker for {name} is open after {failure_count} failures; retry in {}ms", .retry_after.as_millis())]
pub struct CircuitBreakerOpenError {
    pub name: String,
    pub failure_count: u32,
    /// Time until the breaker will admit a probe.
    pub retry_after: Duration,
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_probes: u32,
}

/// Three-state breaker guarding one upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_probes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move OPEN to HALF_OPEN once the recovery timeout has passed.
    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let recovered = inner
            .last_failure
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.recovery_timeout());
        if recovered {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_probes = 0;
            info!(breaker = %self.name, "circuit half-open, admitting probes");
        }
    }

    fn retry_after(&self, inner: &BreakerState, now: Instant) -> Duration {
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at)) => self
                .config
                .recovery_timeout()
                .saturating_sub(now.saturating_duration_since(at)),
            _ => Duration::ZERO,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    /// Whether a request may go to the network. In HALF_OPEN this consumes
    /// one probe slot.
    pub fn allow_request_at(&self, now: Instant) -> bool {
        self.check_at(now).is_ok()
    }

    /// Like [`allow_request_at`](Self::allow_request_at) but explains a
    /// rejection.
    pub fn check_at(&self, now: Instant) -> Result<(), CircuitBreakerOpenError> {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_probes < self.config.half_open_requests.max(1) {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        };
        if admitted {
            Ok(())
        } else {
            Err(CircuitBreakerOpenError {
                name: self.name.clone(),
                failure_count: inner.failure_count,
                retry_after: self.retry_after(&inner, now),
            })
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.half_open_probes = 0;
                info!(breaker = %self.name, "circuit closed");
            }
            // A slow call that started before the circuit opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold.max(1) => {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    recovery_ms = self.config.recovery_timeout_ms,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_probes = 0;
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            _ => {}
        }
    }

    /// Reset to CLOSED with no recorded failures.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.half_open_probes = 0;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        let retry_after_ms = (inner.state == CircuitState::Open)
            .then(|| self.retry_after(&inner, now).as_millis() as u64);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            retry_after_ms,
        }
    }

    /// Admit one request, returning a permit that records its outcome.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, CircuitBreakerOpenError> {
        self.check_at(Instant::now())?;
        Ok(BreakerPermit {
            breaker: self,
            recorded: false,
        })
    }

    /// Run `op` under a permit.
    ///
    /// Transient errors count as failures. Permanent errors mean the
    /// upstream answered, so they count as successes.
    pub fn call<T, E, F>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        E: Classify,
        F: FnOnce() -> Result<T, E>,
    {
        let permit = self.acquire()?;
        match op() {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(error) => {
                permit.outcome(&error);
                Err(ResilienceError::Operation { source: error, attempts: 1 })
            }
        }
    }
}

/// Outcome slot for one admitted request.
///
/// Dropping the permit without recording anything counts as a failure, so a
/// panicking call still trips the breaker.
#[must_use = "record the outcome with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    recorded: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.recorded = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.record_failure();
    }

    /// Record according to how `error` classifies.
    pub fn outcome<E: Classify>(self, error: &E) {
        if error.is_transient() {
            self.failure()
        } else {
            self.success()
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "registry.example.com",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: recovery_ms,
                half_open_requests: probes,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 1000, 1);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        assert_eq!(cb.state_at(t0), CircuitState::Closed);
        cb.record_failure_at(t0);
        assert_eq!(cb.state_at(t0), CircuitState::Open);
        assert!(!cb.allow_request_at(t0));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = breaker(3, 1000, 1);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        cb.record_success();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        assert_eq!(cb.state_at(t0), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let cb = breaker(1, 1000, 1);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        assert_eq!(cb.state_at(t0 + Duration::from_millis(999)), CircuitState::Open);
        assert_eq!(cb.state_at(t0 + Duration::from_millis(1000)), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = breaker(2, 100, 1);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        let later = t0 + Duration::from_millis(150);
        assert!(cb.allow_request_at(later));
        cb.record_success();
        assert_eq!(cb.state_at(later), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(2, 100, 1);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        let later = t0 + Duration::from_millis(150);
        assert!(cb.allow_request_at(later));
        cb.record_failure_at(later);
        assert_eq!(cb.state_at(later), CircuitState::Open);
        assert!(!cb.allow_request_at(later + Duration::from_millis(50)));
    }

    #[test]
    fn test_half_open_limits_probes() {
        let cb = breaker(1, 100, 2);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        let later = t0 + Duration::from_millis(100);
        assert!(cb.allow_request_at(later));
        assert!(cb.allow_request_at(later));
        assert!(!cb.allow_request_at(later));
    }

    #[test]
    fn test_open_error_carries_context() {
        let cb = breaker(2, 1000, 1);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        let err = cb.check_at(t0 + Duration::from_millis(400)).unwrap_err();
        assert_eq!(err.failure_count, 2);
        assert_eq!(err.retry_after, Duration::from_millis(600));
        assert!(err.to_string().contains("registry.example.com"));
    }

    #[test]
    fn test_dropped_permit_counts_as_failure() {
        let cb = breaker(1, 60_000, 1);
        {
            let _permit = cb.acquire().unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.acquire().is_err());
    }

    #[test]
    fn test_snapshot() {
        let cb = breaker(1, 60_000, 1);
        let t0 = Instant::now();
        assert_eq!(cb.snapshot_at(t0).state, CircuitState::Closed);
        cb.record_failure_at(t0);
        let snap = cb.snapshot_at(t0 + Duration::from_secs(10));
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.retry_after_ms, Some(50_000));
        cb.reset();
        assert_eq!(cb.snapshot().state, CircuitState::Closed);
    }
}
