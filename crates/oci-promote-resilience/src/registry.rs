//! Process-wide map of breakers keyed by upstream URI.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};

/// Owns one [`CircuitBreaker`] per registry URI.
///
/// Breakers are created on first use and live as long as the registry.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Breaker for `uri`, created with the default config if missing.
    pub fn get(&self, uri: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(uri, &self.default_config)
    }

    /// Breaker for `uri`, created with `config` if missing. An existing
    /// breaker keeps its original config.
    pub fn get_or_create(&self, uri: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            breakers
                .entry(uri.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(uri, config.clone()))),
        )
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots of every breaker, ordered by URI.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        breakers.iter().map(|b| b.snapshot()).collect()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.lock().unwrap_or_else(|e| e.into_inner()).values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;

    #[test]
    fn test_same_uri_shares_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get("registry-a.example.com");
        let again = registry.get("registry-a.example.com");
        let b = registry.get("registry-b.example.com");
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_breakers_are_independent() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.get("bad.example.com").record_failure();
        assert_eq!(registry.get("bad.example.com").state(), CircuitState::Open);
        assert_eq!(registry.get("good.example.com").state(), CircuitState::Closed);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].name, "bad.example.com");
        assert_eq!(snapshot[0].state, CircuitState::Open);

        registry.reset_all();
        assert_eq!(registry.get("bad.example.com").state(), CircuitState::Closed);
    }

    #[test]
    fn test_existing_breaker_keeps_config() {
        let registry = CircuitBreakerRegistry::default();
        let custom = CircuitBreakerConfig {
            failure_threshold: 9,
            ..Default::default()
        };
        registry.get("r.example.com");
        let breaker = registry.get_or_create("r.example.com", &custom);
        assert_eq!(breaker.config().failure_threshold, 5);
    }
}
