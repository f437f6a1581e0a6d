//! Registry client guarded by a retry policy and a circuit breaker.

use std::sync::Arc;

use oci_promote_resilience::{with_resilience, CircuitBreaker, ResilienceError, RetryPolicy};

use super::{DatasetSummary, Manifest, RegistryClient, RegistryError};

/// Result of a guarded registry call.
pub type GuardedResult<T> = Result<T, ResilienceError<RegistryError>>;

/// Wraps a [`RegistryClient`] so every call goes through
/// [`with_resilience`] with this registry's breaker.
#[derive(Clone)]
pub struct ResilientRegistry {
    inner: Arc<dyn RegistryClient>,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for ResilientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientRegistry")
            .field("uri", &self.inner.uri())
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

impl ResilientRegistry {
    pub fn new(inner: Arc<dyn RegistryClient>, policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, policy, breaker }
    }

    pub fn uri(&self) -> &str {
        self.inner.uri()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` against the wrapped client under retry and breaker.
    pub fn run<T, F>(&self, mut op: F) -> GuardedResult<T>
    where
        F: FnMut(&dyn RegistryClient) -> Result<T, RegistryError>,
    {
        let client = self.inner.as_ref();
        with_resilience(&self.policy, &self.breaker, || op(client))
    }

    pub fn get_manifest(&self, reference: &str) -> GuardedResult<Manifest> {
        self.run(|c| c.get_manifest(reference))
    }

    pub fn get_artifact_digest(&self, reference: &str) -> GuardedResult<String> {
        self.run(|c| c.get_artifact_digest(reference))
    }

    pub fn fetch_blob(&self, reference: &str) -> GuardedResult<Vec<u8>> {
        self.run(|c| c.fetch_blob(reference))
    }

    /// Atomic check-and-create.
    ///
    /// `TagExists` is returned on every attempt, including retries after a
    /// timeout whose create may have landed. The registry cannot tell that
    /// apart from a rival creating the same tag.
    pub fn create_tag(&self, tag: &str, digest: &str) -> GuardedResult<String> {
        self.run(|c| c.create_tag(tag, digest))
    }

    pub fn update_tag(&self, tag: &str, expected: Option<&str>, digest: &str) -> GuardedResult<()> {
        let mut attempt = 0u32;
        self.run(|c| {
            attempt += 1;
            match c.update_tag(tag, expected, digest) {
                Err(RegistryError::Conflict { actual: Some(actual), .. }) if attempt > 1 && actual == digest => Ok(()),
                other => other,
            }
        })
    }

    pub fn delete_tag(&self, tag: &str) -> GuardedResult<bool> {
        self.run(|c| c.delete_tag(tag))
    }

    pub fn list_datasets(&self) -> GuardedResult<Vec<DatasetSummary>> {
        self.run(|c| c.list_datasets())
    }

    pub fn put_artifact(&self, tag: &str, manifest: &Manifest, blob: &[u8]) -> GuardedResult<String> {
        self.run(|c| c.put_artifact(tag, manifest, blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FailureConfig, MemoryRegistry, RegistryOp};
    use oci_promote_resilience::{CircuitBreakerConfig, CircuitState, RetryConfig};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
            ..RetryConfig::default()
        })
    }

    fn guarded(memory: &Arc<MemoryRegistry>, threshold: u32) -> ResilientRegistry {
        let breaker = CircuitBreaker::new(
            memory.uri(),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: 60_000,
                half_open_requests: 1,
            },
        );
        let client: Arc<dyn RegistryClient> = memory.clone();
        ResilientRegistry::new(client, fast_policy(3), Arc::new(breaker))
    }

    fn seeded() -> (Arc<MemoryRegistry>, String) {
        let memory = Arc::new(MemoryRegistry::new("memory://primary.example.com"));
        let digest = memory
            .put_artifact("v1.0.0", &Manifest::for_content(b"orders"), b"orders")
            .unwrap();
        (memory, digest)
    }

    #[test]
    fn test_transient_failures_retried() {
        let (memory, digest) = seeded();
        memory.inject(
            RegistryOp::GetArtifactDigest,
            FailureConfig::unavailable().with_fail_count(2),
        );
        let registry = guarded(&memory, 5);
        assert_eq!(registry.get_artifact_digest("v1.0.0").unwrap(), digest);
        assert_eq!(memory.calls(RegistryOp::GetArtifactDigest), 3);
        assert_eq!(registry.breaker().failure_count(), 0);
    }

    #[test]
    fn test_not_found_not_retried() {
        let (memory, _) = seeded();
        let registry = guarded(&memory, 5);
        let err = registry.get_artifact_digest("v9.9.9").unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert!(err.into_inner().is_some_and(|e| e.is_not_found()));
    }

    #[test]
    fn test_tag_exists_on_first_attempt_is_returned() {
        let (memory, digest) = seeded();
        memory.create_tag("v1.0.0-dev", &digest).unwrap();
        let registry = guarded(&memory, 5);
        let err = registry.create_tag("v1.0.0-dev", &digest).unwrap_err();
        assert!(matches!(err.into_inner(), Some(RegistryError::TagExists { .. })));
    }

    #[test]
    fn test_breaker_opens_and_fails_fast() {
        let (memory, _) = seeded();
        memory.inject(RegistryOp::GetManifest, FailureConfig::connection_refused());
        let registry = guarded(&memory, 3);

        let err = registry.get_manifest("v1.0.0").unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert_eq!(registry.breaker().state(), CircuitState::Open);

        let calls = memory.calls(RegistryOp::GetManifest);
        assert!(registry.get_manifest("v1.0.0").unwrap_err().is_circuit_open());
        assert_eq!(memory.calls(RegistryOp::GetManifest), calls);
    }

    #[test]
    fn test_tag_exists_after_timeout_is_returned() {
        let (memory, digest) = seeded();
        memory.create_tag("v1.0.0-dev", &digest).unwrap();
        memory.inject(RegistryOp::CreateTag, FailureConfig::timeout().with_fail_count(1));
        let registry = guarded(&memory, 5);

        let err = registry.create_tag("v1.0.0-dev", &digest).unwrap_err();
        assert_eq!(err.attempts(), 2);
        match err.into_inner() {
            Some(RegistryError::TagExists { existing_digest, .. }) => assert_eq!(existing_digest, digest),
            other => panic!("expected TagExists, got {:?}", other),
        }
    }

    #[test]
    fn test_put_artifact_stores_under_tag() {
        let (primary, digest) = seeded();
        let secondary = Arc::new(MemoryRegistry::new("memory://mirror.example.com"));
        let registry = guarded(&secondary, 5);
        let manifest = primary.get_manifest("v1.0.0").unwrap();
        let blob = primary.fetch_blob("v1.0.0").unwrap();
        assert_eq!(registry.put_artifact("v1.0.0", &manifest, &blob).unwrap(), digest);
        assert_eq!(secondary.get_artifact_digest("v1.0.0").unwrap(), digest);
    }
}
