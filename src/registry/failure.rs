//! Failure injection for the in-memory registry.

use std::collections::HashMap;
use std::time::Duration;

use super::RegistryError;

/// Registry operations that can fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryOp {
    GetManifest,
    GetArtifactDigest,
    FetchBlob,
    CreateTag,
    UpdateTag,
    DeleteTag,
    PutArtifact,
    ListDatasets,
}

impl RegistryOp {
    pub const ALL: [RegistryOp; 8] = [
        RegistryOp::GetManifest,
        RegistryOp::GetArtifactDigest,
        RegistryOp::FetchBlob,
        RegistryOp::CreateTag,
        RegistryOp::UpdateTag,
        RegistryOp::DeleteTag,
        RegistryOp::PutArtifact,
        RegistryOp::ListDatasets,
    ];
}

/// Kind of error to raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    ConnectionRefused,
    Timeout,
    Unavailable,
    /// A permanent failure
    Other,
}

/// Failure configuration for an operation
#[derive(Debug, Clone, Default)]
pub struct FailureConfig {
    /// Error to return (if any)
    pub failure: Option<InjectedFailure>,
    pub message: Option<String>,
    /// Delay to add before responding
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    pub fn error(failure: InjectedFailure, message: impl Into<String>) -> Self {
        Self {
            failure: Some(failure),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn connection_refused() -> Self {
        Self::error(InjectedFailure::ConnectionRefused, "connection refused")
    }

    pub fn timeout() -> Self {
        Self::error(InjectedFailure::Timeout, "request timed out")
    }

    pub fn unavailable() -> Self {
        Self::error(InjectedFailure::Unavailable, "503 service unavailable")
    }

    /// Only add latency.
    pub fn delay(duration: Duration) -> Self {
        Self {
            delay: Some(duration),
            ..Self::default()
        }
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }

    pub(crate) fn to_error(&self, op: RegistryOp, uri: &str) -> Option<RegistryError> {
        let message = format!(
            "{} ({:?} on {})",
            self.message.as_deref().unwrap_or("injected failure"),
            op,
            uri
        );
        self.failure.map(|failure| match failure {
            InjectedFailure::ConnectionRefused => RegistryError::ConnectionRefused(message),
            InjectedFailure::Timeout => RegistryError::Timeout(message),
            InjectedFailure::Unavailable => RegistryError::Unavailable(message),
            InjectedFailure::Other => RegistryError::Other(message),
        })
    }
}

/// Per-operation failure configs plus call counters.
#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<RegistryOp, FailureConfig>,
    /// Calls since the op's failure was injected (for fail_count tracking)
    failing_calls: HashMap<RegistryOp, u32>,
    /// All calls ever made, per op
    total_calls: HashMap<RegistryOp, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, op: RegistryOp, config: FailureConfig) {
        self.configs.insert(op, config);
        self.failing_calls.insert(op, 0);
    }

    /// Inject the same failure into every operation.
    pub fn inject_all(&mut self, config: FailureConfig) {
        for op in RegistryOp::ALL {
            self.inject(op, config.clone());
        }
    }

    /// Clear all failure injections. Call counts are kept.
    pub fn clear(&mut self) {
        self.configs.clear();
        self.failing_calls.clear();
    }

    pub fn clear_op(&mut self, op: RegistryOp) {
        self.configs.remove(&op);
        self.failing_calls.remove(&op);
    }

    /// Count a call to `op` and return the config to apply, if any.
    pub fn check(&mut self, op: RegistryOp) -> Option<&FailureConfig> {
        *self.total_calls.entry(op).or_insert(0) += 1;

        let config = self.configs.get(&op)?;
        let count = self.failing_calls.entry(op).or_insert(0);
        *count += 1;

        if let Some(fail_limit) = config.fail_count {
            if *count > fail_limit {
                return None;
            }
        }
        Some(config)
    }

    /// Calls made to `op`, failed or not.
    pub fn calls(&self, op: RegistryOp) -> u32 {
        self.total_calls.get(&op).copied().unwrap_or(0)
    }
}
