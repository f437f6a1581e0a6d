use thiserror::Error;

use crate::breaker::CircuitBreakerOpenError;

/// Failure of a call made through the resilience layer.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The breaker rejected the call before it reached the network.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerOpenError),

    /// The operation itself failed, possibly after retries.
    #[error("{source} (after {attempts} attempt(s))")]
    Operation {
        #[source]
        source: E,
        attempts: u32,
    },
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen(_))
    }

    /// Attempts made; zero when the circuit was open.
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::CircuitOpen(_) => 0,
            ResilienceError::Operation { attempts, .. } => *attempts,
        }
    }

    /// The operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::CircuitOpen(_) => None,
            ResilienceError::Operation { source, .. } => Some(source),
        }
    }

    pub fn map<F, E2>(self, f: F) -> ResilienceError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            ResilienceError::CircuitOpen(e) => ResilienceError::CircuitOpen(e),
            ResilienceError::Operation { source, attempts } => ResilienceError::Operation {
                source: f(source),
                attempts,
            },
        }
    }
}
