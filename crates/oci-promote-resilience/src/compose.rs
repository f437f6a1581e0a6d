//! Breaker-guarded retry.

use std::fmt;

use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::ResilienceError;
use crate::retry::{Classify, RetryPolicy};

/// Run `op` with `breaker` as the outer guard and `policy` as the inner
/// retry loop.
///
/// The breaker is consulted before every attempt, so a circuit that opens
/// mid-sequence stops further retries without sleeping. Each attempt records
/// exactly one outcome: transient errors are failures, permanent errors and
/// successes are successes. Permanent errors are returned after one attempt.
pub fn with_resilience<T, E, F>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    mut op: F,
) -> Result<T, ResilienceError<E>>
where
    E: Classify + fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let max = policy.max_attempts();
    let mut attempt = 1;
    loop {
        let permit = breaker.acquire()?;
        match op() {
            Ok(value) => {
                permit.success();
                if attempt > 1 {
                    debug!(breaker = %breaker.name(), attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                permit.outcome(&error);
                if attempt >= max || !policy.should_retry(&error) {
                    return Err(ResilienceError::Operation {
                        source: error,
                        attempts: attempt,
                    });
                }
                let delay = policy.calculate_delay(attempt - 1);
                warn!(
                    breaker = %breaker.name(),
                    attempt,
                    max_attempts = max,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient registry failure, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// A retry policy bound to a breaker.
#[derive(Debug, Clone)]
pub struct Resilience<'a> {
    pub policy: &'a RetryPolicy,
    pub breaker: &'a CircuitBreaker,
}

impl<'a> Resilience<'a> {
    pub fn new(policy: &'a RetryPolicy, breaker: &'a CircuitBreaker) -> Self {
        Self { policy, breaker }
    }

    pub fn run<T, E, F>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        with_resilience(self.policy, self.breaker, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreakerConfig, CircuitState};
    use crate::retry::{RetryConfig, TransientKind};
    use std::cell::Cell;

    #[derive(Debug)]
    enum Failure {
        Down,
        Rejected,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Classify for Failure {
        fn transient_kind(&self) -> Option<TransientKind> {
            match self {
                Failure::Down => Some(TransientKind::Unavailable),
                Failure::Rejected => None,
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            jitter: false,
            ..RetryConfig::default()
        })
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "registry.example.com",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: 60_000,
                half_open_requests: 1,
            },
        )
    }

    #[test]
    fn test_success_passes_through() {
        let cb = breaker(3);
        let result: Result<u32, ResilienceError<Failure>> = with_resilience(&policy(3), &cb, || Ok(7));
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_retries_transient_then_succeeds() {
        let cb = breaker(10);
        let calls = Cell::new(0);
        let result = with_resilience(&policy(3), &cb, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Failure::Down)
            } else {
                Ok("ok")
            }
        });
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.get(), 3);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_permanent_error_not_retried_and_not_counted() {
        let cb = breaker(1);
        let calls = Cell::new(0);
        let result: Result<(), _> = with_resilience(&policy(5), &cb, || {
            calls.set(calls.get() + 1);
            Err(Failure::Rejected)
        });
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert!(matches!(err.into_inner(), Some(Failure::Rejected)));
        assert_eq!(calls.get(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_circuit_stops_retries() {
        let cb = breaker(2);
        let calls = Cell::new(0);
        let result: Result<(), _> = with_resilience(&policy(5), &cb, || {
            calls.set(calls.get() + 1);
            Err(Failure::Down)
        });
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.get(), 2);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_circuit_fails_fast_without_calling() {
        let cb = breaker(1);
        cb.record_failure();
        let calls = Cell::new(0);
        let result: Result<(), ResilienceError<Failure>> = Resilience::new(&policy(3), &cb).run(|| {
            calls.set(calls.get() + 1);
            Ok(())
        });
        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.attempts(), 0);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_exhausted_retries_report_attempts() {
        let cb = breaker(100);
        let result: Result<(), _> = with_resilience(&policy(3), &cb, || Err(Failure::Down));
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert_eq!(cb.failure_count(), 3);
        assert!(err.to_string().contains("after 3 attempt(s)"));
    }
}
