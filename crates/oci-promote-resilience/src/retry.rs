//! Retry with exponential backoff.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Classes of failure worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Connection,
    Timeout,
    Unavailable,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::Connection => write!(f, "connection"),
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Implemented by errors that can tell transient failures from permanent ones.
pub trait Classify {
    /// `Some` if the failure is transient, `None` if retrying cannot help.
    fn transient_kind(&self) -> Option<TransientKind>;

    fn is_transient(&self) -> bool {
        self.transient_kind().is_some()
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Perturb each delay by up to ±25%
    pub jitter: bool,
    /// Transient kinds that are retried; anything else fails immediately
    pub retry_on: Vec<TransientKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
            retry_on: vec![
                TransientKind::Connection,
                TransientKind::Timeout,
                TransientKind::Unavailable,
            ],
        }
    }
}

/// Stateless retry policy built from a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Wait before retry number `attempt` (0 = the first retry).
    ///
    /// `initial_delay_ms * backoff_multiplier^attempt`, capped at
    /// `max_delay_ms`. With jitter enabled the result is scaled by a uniform
    /// factor in `[0.75, 1.25]` and capped again.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let max = self.config.max_delay_ms as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut delay_ms =
            (self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent)).min(max);

        if self.config.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            delay_ms = (delay_ms * factor).min(max);
        }

        if !delay_ms.is_finite() || delay_ms < 0.0 {
            delay_ms = max;
        }
        Duration::from_millis(delay_ms.round() as u64)
    }

    /// Whether `error` is a transient kind this policy retries.
    pub fn should_retry<E: Classify>(&self, error: &E) -> bool {
        error
            .transient_kind()
            .is_some_and(|kind| self.config.retry_on.contains(&kind))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// The last error is returned unchanged.
    pub fn wrap<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let max = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max && self.should_retry(&e) => {
                    let delay = self.calculate_delay(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Step-wise iteration over attempts for callers that interleave their
    /// own logic between tries.
    ///
    /// The iterator sleeps the backoff delay before yielding every attempt
    /// after the first. Breaking out of the loop stops retrying.
    pub fn attempts(&self) -> Attempts<'_> {
        Attempts {
            policy: self,
            next: 1,
        }
    }
}

/// One try within a retry sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u32,
    pub max: u32,
}

impl Attempt {
    pub fn is_last(&self) -> bool {
        self.number >= self.max
    }
}

/// Iterator returned by [`RetryPolicy::attempts`].
#[derive(Debug)]
pub struct Attempts<'a> {
    policy: &'a RetryPolicy,
    next: u32,
}

impl Iterator for Attempts<'_> {
    type Item = Attempt;

    fn next(&mut self) -> Option<Attempt> {
        let max = self.policy.max_attempts();
        if self.next > max {
            return None;
        }
        if self.next > 1 {
            std::thread::sleep(self.policy.calculate_delay(self.next - 2));
        }
        let attempt = Attempt {
            number: self.next,
            max,
        };
        self.next += 1;
        Some(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    enum TestError {
        Transient(TransientKind),
        Permanent,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Classify for TestError {
        fn transient_kind(&self) -> Option<TransientKind> {
            match self {
                TestError::Transient(kind) => Some(*kind),
                TestError::Permanent => None,
            }
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn test_delay_without_jitter_is_exact() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1000,
            jitter: false,
            ..RetryConfig::default()
        });
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(800));
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(1000));
        assert_eq!(policy.calculate_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_non_decreasing() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_delay_ms: 50,
            backoff_multiplier: 1.5,
            max_delay_ms: 5_000,
            jitter: false,
            ..RetryConfig::default()
        });
        let delays: Vec<Duration> = (0..30).map(|n| policy.calculate_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
            ..RetryConfig::default()
        });
        for _ in 0..200 {
            let d = policy.calculate_delay(1).as_millis() as u64;
            assert!((1500..=2500).contains(&d), "delay {} out of range", d);
            assert!(policy.calculate_delay(10).as_millis() as u64 <= 10_000);
        }
    }

    #[test]
    fn test_should_retry_respects_allow_list() {
        let policy = RetryPolicy::new(RetryConfig {
            retry_on: vec![TransientKind::Timeout],
            ..RetryConfig::default()
        });
        assert!(policy.should_retry(&TestError::Transient(TransientKind::Timeout)));
        assert!(!policy.should_retry(&TestError::Transient(TransientKind::Connection)));
        assert!(!policy.should_retry(&TestError::Permanent));
    }

    #[test]
    fn test_wrap_retries_then_succeeds() {
        let calls = Cell::new(0);
        let result = fast(3).wrap(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(TestError::Transient(TransientKind::Unavailable))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_wrap_returns_last_error_when_exhausted() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast(4).wrap(|| {
            calls.set(calls.get() + 1);
            Err(TestError::Transient(TransientKind::Connection))
        });
        assert!(matches!(result, Err(TestError::Transient(TransientKind::Connection))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_wrap_does_not_retry_permanent_errors() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast(5).wrap(|| {
            calls.set(calls.get() + 1);
            Err(TestError::Permanent)
        });
        assert!(matches!(result, Err(TestError::Permanent)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_attempts_iterator() {
        let attempts: Vec<Attempt> = fast(3).attempts().collect();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].number, 1);
        assert!(!attempts[1].is_last());
        assert!(attempts[2].is_last());
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(fast(0).attempts().count(), 1);
        assert_eq!(RetryPolicy::no_retry().attempts().count(), 1);
    }
}
