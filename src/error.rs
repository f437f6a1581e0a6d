//! Promotion error taxonomy and stable CLI exit codes.

use oci_promote_cache::CacheError;
use oci_promote_resilience::{Classify, ResilienceError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ConfigError;
use crate::gates::GateResult;
use crate::promotion::StoreError;
use crate::registry::RegistryError;

/// Promotion result type
pub type PromotionResult<T> = Result<T, PromotionError>;

/// Stable exit codes of the `oci-promote` CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    /// Local I/O, configuration or any unclassified failure
    General = 1,
    /// Usage or missing-argument error
    Usage = 2,
    /// Registry unreachable after retries, or circuit open
    RegistryUnavailable = 5,
    SignatureVerification = 6,
    GateValidation = 8,
    InvalidTransition = 9,
    /// Tag already exists (race lost) or concurrent modification
    TagExists = 10,
    /// Rollback target was never promoted
    VersionNotPromoted = 11,
    AuthorizationDenied = 12,
    EnvironmentLocked = 13,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::General),
            2 => Some(ExitCode::Usage),
            5 => Some(ExitCode::RegistryUnavailable),
            6 => Some(ExitCode::SignatureVerification),
            8 => Some(ExitCode::GateValidation),
            9 => Some(ExitCode::InvalidTransition),
            10 => Some(ExitCode::TagExists),
            11 => Some(ExitCode::VersionNotPromoted),
            12 => Some(ExitCode::AuthorizationDenied),
            13 => Some(ExitCode::EnvironmentLocked),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

/// Errors from promotion, rollback and impact analysis
#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition { from: String, to: String, reason: String },

    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),

    #[error("environment {environment} is locked{}", .reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    EnvironmentLocked {
        environment: String,
        reason: Option<String>,
    },

    #[error("gate validation failed for {tag} -> {environment}: {}", .failed.join(", "))]
    GateValidation {
        tag: String,
        environment: String,
        failed: Vec<String>,
        results: Vec<GateResult>,
    },

    #[error("signature verification failed for {tag} ({digest}): {reason}")]
    SignatureVerification { tag: String, digest: String, reason: String },

    #[error("operator {operator} not authorized: {reason}")]
    AuthorizationDenied { operator: String, reason: String },

    #[error("tag {tag} already exists at {existing_digest}")]
    TagExists { tag: String, existing_digest: String },

    #[error("tag {tag} was modified concurrently: expected {}, found {}", .expected.as_deref().unwrap_or("<absent>"), .actual.as_deref().unwrap_or("<absent>"))]
    ConcurrentModification {
        tag: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("{tag} was not promoted to {environment}: {reason}")]
    VersionNotPromoted {
        tag: String,
        environment: String,
        reason: String,
    },

    #[error("registry {registry} unavailable after {attempts} attempt(s): {message}")]
    RegistryUnavailable {
        registry: String,
        attempts: u32,
        message: String,
    },

    #[error("registry {registry} circuit open after {failure_count} failures; retry in {retry_after_ms}ms")]
    CircuitOpen {
        registry: String,
        failure_count: u32,
        retry_after_ms: u64,
    },

    #[error("registry {registry}: {source}")]
    Registry {
        registry: String,
        #[source]
        source: RegistryError,
    },

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PromotionError {
    /// Classify a guarded registry failure against `registry`.
    pub fn from_registry(registry: &str, error: ResilienceError<RegistryError>) -> Self {
        match error {
            ResilienceError::CircuitOpen(open) => PromotionError::CircuitOpen {
                registry: registry.to_string(),
                failure_count: open.failure_count,
                retry_after_ms: open.retry_after.as_millis() as u64,
            },
            ResilienceError::Operation { source, attempts } => match source {
                RegistryError::TagExists { tag, existing_digest } => PromotionError::TagExists { tag, existing_digest },
                RegistryError::Conflict { tag, expected, actual } => {
                    PromotionError::ConcurrentModification { tag, expected, actual }
                }
                source if source.is_transient() => PromotionError::RegistryUnavailable {
                    registry: registry.to_string(),
                    attempts,
                    message: source.to_string(),
                },
                source => PromotionError::Registry {
                    registry: registry.to_string(),
                    source,
                },
            },
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            PromotionError::InvalidTransition { .. } | PromotionError::UnknownEnvironment(_) => {
                ExitCode::InvalidTransition
            }
            PromotionError::EnvironmentLocked { .. } => ExitCode::EnvironmentLocked,
            PromotionError::GateValidation { .. } => ExitCode::GateValidation,
            PromotionError::SignatureVerification { .. } => ExitCode::SignatureVerification,
            PromotionError::AuthorizationDenied { .. } => ExitCode::AuthorizationDenied,
            PromotionError::TagExists { .. } | PromotionError::ConcurrentModification { .. } => ExitCode::TagExists,
            PromotionError::VersionNotPromoted { .. } => ExitCode::VersionNotPromoted,
            PromotionError::RegistryUnavailable { .. } | PromotionError::CircuitOpen { .. } => {
                ExitCode::RegistryUnavailable
            }
            PromotionError::Registry { .. }
            | PromotionError::Cache(_)
            | PromotionError::Store(_)
            | PromotionError::Config(_) => ExitCode::General,
        }
    }

    /// Short machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PromotionError::InvalidTransition { .. } => "invalid_transition",
            PromotionError::UnknownEnvironment(_) => "unknown_environment",
            PromotionError::EnvironmentLocked { .. } => "environment_locked",
            PromotionError::GateValidation { .. } => "gate_validation",
            PromotionError::SignatureVerification { .. } => "signature_verification",
            PromotionError::AuthorizationDenied { .. } => "authorization_denied",
            PromotionError::TagExists { .. } => "tag_exists",
            PromotionError::ConcurrentModification { .. } => "concurrent_modification",
            PromotionError::VersionNotPromoted { .. } => "version_not_promoted",
            PromotionError::RegistryUnavailable { .. } => "registry_unavailable",
            PromotionError::CircuitOpen { .. } => "circuit_open",
            PromotionError::Registry { .. } => "registry",
            PromotionError::Cache(_) => "cache",
            PromotionError::Store(_) => "record_store",
            PromotionError::Config(_) => "config",
        }
    }

    /// `{error, kind, exit_code, ...context}` for JSON output.
    pub fn to_json(&self) -> Value {
        let mut out = json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "exit_code": self.exit_code().as_i32(),
        });
        let context = match self {
            PromotionError::InvalidTransition { from, to, .. } => json!({"from": from, "to": to}),
            PromotionError::UnknownEnvironment(environment) => json!({"environment": environment}),
            PromotionError::EnvironmentLocked { environment, reason } => {
                json!({"environment": environment, "reason": reason})
            }
            PromotionError::GateValidation {
                tag,
                environment,
                failed,
                results,
            } => json!({"tag": tag, "environment": environment, "failed_gates": failed, "gate_results": results}),
            PromotionError::SignatureVerification { tag, digest, reason } => {
                json!({"tag": tag, "digest": digest, "reason": reason})
            }
            PromotionError::AuthorizationDenied { operator, reason } => json!({"operator": operator, "reason": reason}),
            PromotionError::TagExists { tag, existing_digest } => json!({"tag": tag, "existing_digest": existing_digest}),
            PromotionError::ConcurrentModification { tag, expected, actual } => {
                json!({"tag": tag, "expected": expected, "actual": actual})
            }
            PromotionError::VersionNotPromoted { tag, environment, .. } => {
                json!({"tag": tag, "environment": environment})
            }
            PromotionError::RegistryUnavailable { registry, attempts, .. } => {
                json!({"registry": registry, "attempts": attempts})
            }
            PromotionError::CircuitOpen {
                registry,
                failure_count,
                retry_after_ms,
            } => json!({"registry": registry, "failure_count": failure_count, "retry_after_ms": retry_after_ms}),
            PromotionError::Registry { registry, .. } => json!({"registry": registry}),
            PromotionError::Cache(_) | PromotionError::Store(_) | PromotionError::Config(_) => json!({}),
        };
        if let (Value::Object(out), Value::Object(context)) = (&mut out, context) {
            out.extend(context);
        }
        out
    }
}
