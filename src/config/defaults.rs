//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Primary registry (default: a `file://` registry in the working directory)
    pub registry: String,

    /// Record directory (default: ".oci-promote/records")
    pub records_dir: String,

    /// Environment chain (default: dev, staging, prod)
    pub environments: Vec<String>,

    /// Retry attempts including the first (default: 3)
    pub retry_max_attempts: u32,

    /// First retry delay (default: 1000ms)
    pub retry_initial_delay_ms: u64,

    /// Backoff multiplier (default: 2.0)
    pub retry_backoff_multiplier: f64,

    /// Delay cap (default: 30000ms)
    pub retry_max_delay_ms: u64,

    /// Consecutive failures before the circuit opens (default: 5)
    pub breaker_failure_threshold: u32,

    /// Open-state duration (default: 30000ms)
    pub breaker_recovery_timeout_ms: u64,

    /// Cache size limit (default: 10 GiB)
    pub cache_max_size_bytes: u64,

    /// Mutable-tag TTL (default: 24h)
    pub cache_ttl_hours: u64,

    /// Registry lock wait (default: 30000ms)
    pub registry_timeout_ms: u64,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            registry: "file://.oci-promote/registry".to_string(),
            records_dir: ".oci-promote/records".to_string(),
            environments: vec!["dev".to_string(), "staging".to_string(), "prod".to_string()],
            retry_max_attempts: 3,
            retry_initial_delay_ms: 1000,
            retry_backoff_multiplier: 2.0,
            retry_max_delay_ms: 30_000,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_ms: 30_000,
            cache_max_size_bytes: 10 * 1024 * 1024 * 1024,
            cache_ttl_hours: 24,
            registry_timeout_ms: 30_000,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        let environments: Vec<serde_json::Value> = self
            .environments
            .iter()
            .map(|name| serde_json::json!({ "name": name }))
            .collect();
        serde_json::json!({
            "registry": self.registry,
            "records_dir": self.records_dir,
            "environments": environments,
            "retry": {
                "max_attempts": self.retry_max_attempts,
                "initial_delay_ms": self.retry_initial_delay_ms,
                "backoff_multiplier": self.retry_backoff_multiplier,
                "max_delay_ms": self.retry_max_delay_ms,
                "jitter": true
            },
            "circuit_breaker": {
                "failure_threshold": self.breaker_failure_threshold,
                "recovery_timeout_ms": self.breaker_recovery_timeout_ms,
                "half_open_requests": 1
            },
            "cache": {
                "enabled": true,
                "max_size_bytes": self.cache_max_size_bytes,
                "ttl_hours": self.cache_ttl_hours
            },
            "secondary_registries": [],
            "registry_timeout_ms": self.registry_timeout_ms
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let defaults = BuiltinDefaults::default();
        assert_eq!(defaults.environments, vec!["dev", "staging", "prod"]);
        assert_eq!(defaults.retry_max_attempts, 3);
        assert_eq!(defaults.breaker_failure_threshold, 5);
        assert_eq!(defaults.cache_ttl_hours, 24);
    }

    #[test]
    fn test_to_value() {
        let value = BuiltinDefaults::default().to_value();
        assert_eq!(value["environments"][1]["name"], "staging");
        assert_eq!(value["retry"]["max_delay_ms"], 30_000);
        assert_eq!(value["circuit_breaker"]["half_open_requests"], 1);
        assert!(value.get("authorization").is_none());
    }
}
