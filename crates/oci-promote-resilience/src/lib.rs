//! Retry and circuit breaking for calls to flaky upstreams.
//!
//! [`RetryPolicy`] retries transient failures with exponential backoff.
//! [`CircuitBreaker`] stops calling an upstream that keeps failing and
//! probes it again after a recovery timeout. [`with_resilience`] composes
//! the two with the breaker as the outer guard. Errors opt in through the
//! [`Classify`] trait.

pub mod breaker;
pub mod compose;
pub mod error;
pub mod registry;
pub mod retry;

pub use breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerOpenError, CircuitState,
};
pub use compose::{with_resilience, Resilience};
pub use error::ResilienceError;
pub use registry::CircuitBreakerRegistry;
pub use retry::{Attempt, Attempts, Classify, RetryConfig, RetryPolicy, TransientKind};
