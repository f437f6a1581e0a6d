//! In-memory registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use oci_promote_cache::compute_digest;

use super::failure::{FailureConfig, FailureInjector, RegistryOp};
use super::{DatasetSummary, Manifest, RegistryClient, RegistryError, RegistryResult};

#[derive(Debug, Default)]
struct MemoryState {
    blobs: HashMap<String, Vec<u8>>,
    manifests: HashMap<String, Manifest>,
    tags: BTreeMap<String, String>,
}

/// Registry held entirely in memory.
///
/// Every operation runs under one mutex, so `create_tag` and `update_tag`
/// are atomic with respect to each other.
#[derive(Debug)]
pub struct MemoryRegistry {
    uri: String,
    state: Mutex<MemoryState>,
    failures: Mutex<FailureInjector>,
}

impl MemoryRegistry {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            state: Mutex::new(MemoryState::default()),
            failures: Mutex::new(FailureInjector::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures(&self) -> MutexGuard<'_, FailureInjector> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inject(&self, op: RegistryOp, config: FailureConfig) {
        self.failures().inject(op, config);
    }

    pub fn inject_all(&self, config: FailureConfig) {
        self.failures().inject_all(config);
    }

    pub fn clear_failures(&self) {
        self.failures().clear();
    }

    pub fn calls(&self, op: RegistryOp) -> u32 {
        self.failures().calls(op)
    }

    /// Current tag table.
    pub fn tags(&self) -> BTreeMap<String, String> {
        self.state().tags.clone()
    }

    /// Apply injected latency and failure for `op`.
    fn before(&self, op: RegistryOp) -> RegistryResult<()> {
        let (delay, error) = {
            let mut failures = self.failures();
            match failures.check(op) {
                Some(config) => (config.delay, config.to_error(op, &self.uri)),
                None => (None, None),
            }
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        error.map_or(Ok(()), Err)
    }

    fn resolve(&self, state: &MemoryState, reference: &str) -> RegistryResult<String> {
        if reference.starts_with(oci_promote_cache::DIGEST_PREFIX) {
            if state.manifests.contains_key(reference) {
                return Ok(reference.to_string());
            }
        } else if let Some(digest) = state.tags.get(reference) {
            return Ok(digest.clone());
        }
        Err(RegistryError::NotFound(format!("{} in {}", reference, self.uri)))
    }
}

impl RegistryClient for MemoryRegistry {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn get_manifest(&self, reference: &str) -> RegistryResult<Manifest> {
        self.before(RegistryOp::GetManifest)?;
        let state = self.state();
        let digest = self.resolve(&state, reference)?;
        state
            .manifests
            .get(&digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("manifest {}", digest)))
    }

    fn get_artifact_digest(&self, reference: &str) -> RegistryResult<String> {
        self.before(RegistryOp::GetArtifactDigest)?;
        let state = self.state();
        self.resolve(&state, reference)
    }

    fn fetch_blob(&self, reference: &str) -> RegistryResult<Vec<u8>> {
        self.before(RegistryOp::FetchBlob)?;
        let state = self.state();
        let digest = self.resolve(&state, reference)?;
        state
            .blobs
            .get(&digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("blob {}", digest)))
    }

    fn create_tag(&self, tag: &str, digest: &str) -> RegistryResult<String> {
        self.before(RegistryOp::CreateTag)?;
        let mut state = self.state();
        if let Some(existing) = state.tags.get(tag) {
            return Err(RegistryError::TagExists {
                tag: tag.to_string(),
                existing_digest: existing.clone(),
            });
        }
        if !state.manifests.contains_key(digest) {
            return Err(RegistryError::NotFound(format!("{} in {}", digest, self.uri)));
        }
        state.tags.insert(tag.to_string(), digest.to_string());
        Ok(digest.to_string())
    }

    fn update_tag(&self, tag: &str, expected: Option<&str>, digest: &str) -> RegistryResult<()> {
        self.before(RegistryOp::UpdateTag)?;
        let mut state = self.state();
        let current = state.tags.get(tag).cloned();
        if current.as_deref() != expected {
            return Err(RegistryError::Conflict {
                tag: tag.to_string(),
                expected: expected.map(String::from),
                actual: current,
            });
        }
        if !state.manifests.contains_key(digest) {
            return Err(RegistryError::NotFound(format!("{} in {}", digest, self.uri)));
        }
        state.tags.insert(tag.to_string(), digest.to_string());
        Ok(())
    }

    fn delete_tag(&self, tag: &str) -> RegistryResult<bool> {
        self.before(RegistryOp::DeleteTag)?;
        Ok(self.state().tags.remove(tag).is_some())
    }

    fn put_artifact(&self, tag: &str, manifest: &Manifest, blob: &[u8]) -> RegistryResult<String> {
        self.before(RegistryOp::PutArtifact)?;
        let actual = compute_digest(blob);
        if actual != manifest.digest {
            return Err(RegistryError::DigestMismatch {
                expected: manifest.digest.clone(),
                actual,
            });
        }
        let mut state = self.state();
        state.blobs.insert(actual.clone(), blob.to_vec());
        state.manifests.insert(actual.clone(), manifest.clone());
        state.tags.insert(tag.to_string(), actual.clone());
        Ok(actual)
    }

    fn list_datasets(&self) -> RegistryResult<Vec<DatasetSummary>> {
        self.before(RegistryOp::ListDatasets)?;
        let state = self.state();
        Ok(state
            .tags
            .iter()
            .filter_map(|(tag, digest)| {
                let manifest = state.manifests.get(digest)?;
                Some(DatasetSummary {
                    name: manifest.dataset_name().unwrap_or(tag).to_string(),
                    tag: tag.clone(),
                    digest: digest.clone(),
                    size: manifest.size,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::annotations;

    fn seeded() -> (MemoryRegistry, String) {
        let registry = MemoryRegistry::new("memory://primary.example.com");
        let manifest = Manifest::for_content(b"orders").with_annotation(annotations::DATASET, "orders");
        let digest = registry.put_artifact("v1.0.0", &manifest, b"orders").unwrap();
        (registry, digest)
    }

    #[test]
    fn test_put_and_resolve() {
        let (registry, digest) = seeded();
        assert_eq!(registry.get_artifact_digest("v1.0.0").unwrap(), digest);
        assert_eq!(registry.get_artifact_digest(&digest).unwrap(), digest);
        assert_eq!(registry.fetch_blob("v1.0.0").unwrap(), b"orders");
        assert!(registry.get_manifest("v9").unwrap_err().is_not_found());
    }

    #[test]
    fn test_put_rejects_mismatched_blob() {
        let registry = MemoryRegistry::new("memory://r");
        let manifest = Manifest::for_content(b"one");
        let err = registry.put_artifact("t", &manifest, b"two").unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    }

    #[test]
    fn test_create_tag_is_exclusive() {
        let (registry, digest) = seeded();
        registry.create_tag("v1.0.0-dev", &digest).unwrap();
        match registry.create_tag("v1.0.0-dev", &digest).unwrap_err() {
            RegistryError::TagExists { tag, existing_digest } => {
                assert_eq!(tag, "v1.0.0-dev");
                assert_eq!(existing_digest, digest);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_create_tag_requires_known_digest() {
        let (registry, _) = seeded();
        let unknown = compute_digest(b"nope");
        assert!(registry.create_tag("x", &unknown).unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_tag_compare_and_swap() {
        let (registry, first) = seeded();
        let second = registry
            .put_artifact("v2.0.0", &Manifest::for_content(b"orders v2"), b"orders v2")
            .unwrap();

        registry.update_tag("latest-dev", None, &first).unwrap();
        assert!(matches!(
            registry.update_tag("latest-dev", None, &second),
            Err(RegistryError::Conflict { .. })
        ));
        registry.update_tag("latest-dev", Some(first.as_str()), &second).unwrap();
        assert_eq!(registry.get_artifact_digest("latest-dev").unwrap(), second);
    }

    #[test]
    fn test_copy_tag_between_registries() {
        let (primary, digest) = seeded();
        let mirror = MemoryRegistry::new("memory://mirror.example.com");
        assert_eq!(primary.copy_tag("v1.0.0", &mirror).unwrap(), digest);
        assert_eq!(mirror.fetch_blob("v1.0.0").unwrap(), b"orders");
    }

    #[test]
    fn test_injected_failures() {
        let (registry, _) = seeded();
        registry.inject(RegistryOp::GetManifest, FailureConfig::unavailable().with_fail_count(1));
        assert!(matches!(
            registry.get_manifest("v1.0.0"),
            Err(RegistryError::Unavailable(_))
        ));
        assert!(registry.get_manifest("v1.0.0").is_ok());
        assert_eq!(registry.calls(RegistryOp::GetManifest), 2);
    }

    #[test]
    fn test_list_datasets() {
        let (registry, digest) = seeded();
        registry.create_tag("v1.0.0-dev", &digest).unwrap();
        let datasets = registry.list_datasets().unwrap();
        assert_eq!(datasets.len(), 2);
        assert!(datasets.iter().all(|d| d.name == "orders"));
    }
}
