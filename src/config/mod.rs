//! Layered promotion configuration.
//!
//! Layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. User config (`~/.config/oci-promote/config.toml`)
//! 3. Repo config (`.oci-promote.toml` or `--config`)
//! 4. CLI flags
//!
//! Layers are merged as JSON values and deserialized once into
//! [`PromotionConfig`], so gate definitions and every other typed field are
//! resolved at load time.

mod defaults;
mod load;
mod merge;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use oci_promote_cache::CacheConfig;
use oci_promote_resilience::{CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthorizationConfig;
use crate::gates::{GateKind, GateSpec};
use crate::verify::TrustedKey;

pub use defaults::BuiltinDefaults;
pub use load::{default_host_config_path, ConfigLoader, ConfigOrigin, ConfigSource, LoadedConfig, REPO_CONFIG_FILENAME};
pub use merge::{deep_merge, merge_layers};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// One deployment environment in the promotion chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_reason: Option<String>,
    /// Unsigned artifacts are rejected when set, otherwise only warned about
    #[serde(default = "default_require_signature")]
    pub require_signature: bool,
    /// Gates checked before promoting into this environment
    #[serde(default)]
    pub gates: Vec<GateSpec>,
}

fn default_require_signature() -> bool {
    true
}

impl EnvironmentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locked: false,
            lock_reason: None,
            require_signature: true,
            gates: Vec::new(),
        }
    }
}

/// An explicitly allowed environment hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
}

/// Local artifact cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Defaults to `~/.cache/oci-promote/artifacts`
    pub dir: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub ttl_hours: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            enabled: true,
            dir: None,
            max_size_bytes: defaults.max_size_bytes,
            ttl_hours: defaults.ttl_hours,
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        let base = match &self.dir {
            Some(dir) => CacheConfig::at(dir),
            None => CacheConfig::default(),
        };
        base.with_max_size(self.max_size_bytes).with_ttl_hours(self.ttl_hours)
    }
}

/// Trusted signing keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub trusted_keys: Vec<TrustedKey>,
}

/// Fully merged configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// Primary registry URI
    pub registry: String,
    /// Where promotion and rollback records are kept
    pub records_dir: PathBuf,
    /// Ordered chain, first to last
    pub environments: Vec<EnvironmentConfig>,
    /// Explicit hops; when absent only the next environment in the chain
    /// is reachable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_transitions: Option<Vec<Transition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub signing: SigningConfig,
    /// Replicated to on every promotion
    #[serde(default)]
    pub secondary_registries: Vec<String>,
    /// Upper bound on waiting for a registry lock
    #[serde(default = "default_registry_timeout_ms")]
    pub registry_timeout_ms: u64,
}

fn default_registry_timeout_ms() -> u64 {
    30_000
}

impl PromotionConfig {
    /// Built-in defaults only.
    pub fn builtin() -> Result<Self, ConfigError> {
        serde_json::from_value(BuiltinDefaults::default().to_value())
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// A minimal config over the given chain, for embedding and tests.
    pub fn with_environments<I, S>(registry: impl Into<String>, records_dir: impl Into<PathBuf>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            registry: registry.into(),
            records_dir: records_dir.into(),
            environments: names.into_iter().map(EnvironmentConfig::new).collect(),
            allowed_transitions: None,
            authorization: None,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheSettings::default(),
            signing: SigningConfig::default(),
            secondary_registries: Vec::new(),
            registry_timeout_ms: default_registry_timeout_ms(),
        }
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }

    pub fn environment_mut(&mut self, name: &str) -> Option<&mut EnvironmentConfig> {
        self.environments.iter_mut().find(|e| e.name == name)
    }

    /// Position of `name` in the chain.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.environments.iter().position(|e| e.name == name)
    }

    pub fn is_first_environment(&self, name: &str) -> bool {
        self.position(name) == Some(0)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    /// Whether `from -> to` is a legal hop. Both names must exist.
    pub fn check_transition(&self, from: &str, to: &str) -> Result<(), String> {
        let (Some(from_pos), Some(to_pos)) = (self.position(from), self.position(to)) else {
            return Err("unknown environment".to_string());
        };
        if from_pos == to_pos {
            return Err("source and target are the same environment".to_string());
        }
        match &self.allowed_transitions {
            Some(allowed) => {
                if allowed.iter().any(|t| t.from == from && t.to == to) {
                    Ok(())
                } else {
                    Err(format!("{} -> {} is not in allowed_transitions", from, to))
                }
            }
            None if to_pos == from_pos + 1 => Ok(()),
            None if to_pos < from_pos => Err("promotion cannot move backwards in the chain".to_string()),
            None => Err(format!(
                "cannot skip {}",
                self.environments[from_pos + 1..to_pos]
                    .iter()
                    .map(|e| e.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.registry.trim().is_empty() {
            return invalid("registry must not be empty".to_string());
        }
        if self.environments.is_empty() {
            return invalid("at least one environment is required".to_string());
        }
        let mut seen = HashSet::new();
        for env in &self.environments {
            if env.name.trim().is_empty() {
                return invalid("environment names must not be empty".to_string());
            }
            if !seen.insert(env.name.as_str()) {
                return invalid(format!("duplicate environment '{}'", env.name));
            }
            for gate in &env.gates {
                if let GateKind::Tests { min_pass_rate } = gate.kind {
                    if !(0.0..=1.0).contains(&min_pass_rate) {
                        return invalid(format!(
                            "environment '{}': min_pass_rate must be within [0, 1]",
                            env.name
                        ));
                    }
                }
            }
        }
        if let Some(transitions) = &self.allowed_transitions {
            for t in transitions {
                for name in [&t.from, &t.to] {
                    if !seen.contains(name.as_str()) {
                        return invalid(format!("transition {} -> {} names unknown environment '{}'", t.from, t.to, name));
                    }
                }
            }
        }

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be > 0".to_string());
        }
        if self.retry.backoff_multiplier <= 0.0 {
            return invalid("retry.backoff_multiplier must be > 0".to_string());
        }
        if self.retry.max_delay_ms == 0 {
            return invalid("retry.max_delay_ms must be > 0".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be > 0".to_string());
        }
        if self.circuit_breaker.recovery_timeout_ms == 0 {
            return invalid("circuit_breaker.recovery_timeout_ms must be > 0".to_string());
        }
        if self.circuit_breaker.half_open_requests == 0 {
            return invalid("circuit_breaker.half_open_requests must be > 0".to_string());
        }
        if self.registry_timeout_ms == 0 {
            return invalid("registry_timeout_ms must be > 0".to_string());
        }
        Ok(())
    }
}
