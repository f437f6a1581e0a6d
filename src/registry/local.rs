//! Directory-backed registry for `file://` URIs.
//!
//! ```text
//! <root>/
//! ├── .lock
//! ├── tags.json                       # {tag: digest}
//! ├── blobs/sha256/<hex>
//! └── manifests/sha256/<hex>.json
//! ```
//!
//! Tag mutations hold an exclusive lock on the root for the whole
//! read-modify-write of `tags.json`, so `create_tag` is atomic across
//! processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use oci_promote_cache::{compute_digest, digest_hex, write_atomic, CacheLock, LockError};
use tracing::debug;

use super::{DatasetSummary, Manifest, RegistryClient, RegistryError, RegistryResult};

/// Registry stored under a local directory.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    uri: String,
    root: PathBuf,
    lock_timeout: Duration,
}

impl LocalRegistry {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
    const TAGS_FILENAME: &'static str = "tags.json";

    /// Open the registry at `path`, creating the layout if needed.
    pub fn open(uri: impl Into<String>, path: impl AsRef<Path>) -> RegistryResult<Self> {
        let root = path.as_ref().to_path_buf();
        for dir in [root.join("blobs/sha256"), root.join("manifests/sha256")] {
            fs::create_dir_all(&dir).map_err(RegistryError::io(&dir))?;
        }
        Ok(Self {
            uri: uri.into(),
            root,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Bound on how long a tag mutation waits for the registry lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> RegistryResult<CacheLock> {
        CacheLock::acquire(&self.root, self.lock_timeout).map_err(|e| match e {
            LockError::Timeout { path, timeout } => RegistryError::Timeout(format!(
                "registry lock {} not acquired within {:?}",
                path.display(),
                timeout
            )),
            LockError::Io { path, source } => RegistryError::Io { path, source },
        })
    }

    fn tags_path(&self) -> PathBuf {
        self.root.join(Self::TAGS_FILENAME)
    }

    fn blob_path(&self, hex: &str) -> PathBuf {
        self.root.join("blobs/sha256").join(hex)
    }

    fn manifest_path(&self, hex: &str) -> PathBuf {
        self.root.join("manifests/sha256").join(format!("{}.json", hex))
    }

    fn hex(digest: &str) -> RegistryResult<&str> {
        digest_hex(digest).ok_or_else(|| RegistryError::InvalidReference(digest.to_string()))
    }

    fn read_tags(&self) -> RegistryResult<BTreeMap<String, String>> {
        let path = self.tags_path();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| RegistryError::Other(format!("corrupt {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(RegistryError::Io { path, source: e }),
        }
    }

    fn write_tags(&self, tags: &BTreeMap<String, String>) -> RegistryResult<()> {
        let path = self.tags_path();
        let bytes = serde_json::to_vec_pretty(tags)
            .map_err(|e| RegistryError::Other(format!("serialize tags: {}", e)))?;
        write_atomic(&path, &bytes).map_err(RegistryError::io(path))
    }

    fn has_manifest(&self, digest: &str) -> RegistryResult<bool> {
        Ok(self.manifest_path(Self::hex(digest)?).exists())
    }

    fn resolve(&self, reference: &str) -> RegistryResult<String> {
        if reference.starts_with(oci_promote_cache::DIGEST_PREFIX) {
            if self.has_manifest(reference)? {
                return Ok(reference.to_string());
            }
        } else if let Some(digest) = self.read_tags()?.remove(reference) {
            return Ok(digest);
        }
        Err(RegistryError::NotFound(format!("{} in {}", reference, self.uri)))
    }

    fn read_manifest(&self, digest: &str) -> RegistryResult<Manifest> {
        let path = self.manifest_path(Self::hex(digest)?);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RegistryError::NotFound(format!("manifest {}", digest))
            } else {
                RegistryError::Io { path: path.clone(), source: e }
            }
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RegistryError::Other(format!("corrupt manifest {}: {}", path.display(), e)))
    }
}

impl RegistryClient for LocalRegistry {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn get_manifest(&self, reference: &str) -> RegistryResult<Manifest> {
        let digest = self.resolve(reference)?;
        self.read_manifest(&digest)
    }

    fn get_artifact_digest(&self, reference: &str) -> RegistryResult<String> {
        self.resolve(reference)
    }

    fn fetch_blob(&self, reference: &str) -> RegistryResult<Vec<u8>> {
        let digest = self.resolve(reference)?;
        let path = self.blob_path(Self::hex(&digest)?);
        let blob = fs::read(&path).map_err(RegistryError::io(&path))?;
        let actual = compute_digest(&blob);
        if actual != digest {
            return Err(RegistryError::DigestMismatch { expected: digest, actual });
        }
        Ok(blob)
    }

    fn create_tag(&self, tag: &str, digest: &str) -> RegistryResult<String> {
        let _lock = self.lock()?;
        let mut tags = self.read_tags()?;
        if let Some(existing) = tags.get(tag) {
            return Err(RegistryError::TagExists {
                tag: tag.to_string(),
                existing_digest: existing.clone(),
            });
        }
        if !self.has_manifest(digest)? {
            return Err(RegistryError::NotFound(format!("{} in {}", digest, self.uri)));
        }
        tags.insert(tag.to_string(), digest.to_string());
        self.write_tags(&tags)?;
        debug!(registry = %self.uri, tag, digest, "tag created");
        Ok(digest.to_string())
    }

    fn update_tag(&self, tag: &str, expected: Option<&str>, digest: &str) -> RegistryResult<()> {
        let _lock = self.lock()?;
        let mut tags = self.read_tags()?;
        let current = tags.get(tag).cloned();
        if current.as_deref() != expected {
            return Err(RegistryError::Conflict {
                tag: tag.to_string(),
                expected: expected.map(String::from),
                actual: current,
            });
        }
        if !self.has_manifest(digest)? {
            return Err(RegistryError::NotFound(format!("{} in {}", digest, self.uri)));
        }
        tags.insert(tag.to_string(), digest.to_string());
        self.write_tags(&tags)
    }

    fn delete_tag(&self, tag: &str) -> RegistryResult<bool> {
        let _lock = self.lock()?;
        let mut tags = self.read_tags()?;
        let existed = tags.remove(tag).is_some();
        if existed {
            self.write_tags(&tags)?;
        }
        Ok(existed)
    }

    fn put_artifact(&self, tag: &str, manifest: &Manifest, blob: &[u8]) -> RegistryResult<String> {
        let actual = compute_digest(blob);
        if actual != manifest.digest {
            return Err(RegistryError::DigestMismatch {
                expected: manifest.digest.clone(),
                actual,
            });
        }
        let hex = Self::hex(&actual)?.to_string();

        let blob_path = self.blob_path(&hex);
        write_atomic(&blob_path, blob).map_err(RegistryError::io(&blob_path))?;
        let manifest_path = self.manifest_path(&hex);
        let manifest_bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| RegistryError::Other(format!("serialize manifest: {}", e)))?;
        write_atomic(&manifest_path, &manifest_bytes).map_err(RegistryError::io(&manifest_path))?;

        let _lock = self.lock()?;
        let mut tags = self.read_tags()?;
        tags.insert(tag.to_string(), actual.clone());
        self.write_tags(&tags)?;
        Ok(actual)
    }

    fn list_datasets(&self) -> RegistryResult<Vec<DatasetSummary>> {
        let tags = self.read_tags()?;
        let mut datasets = Vec::with_capacity(tags.len());
        for (tag, digest) in tags {
            let manifest = match self.read_manifest(&digest) {
                Ok(m) => m,
                Err(RegistryError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            datasets.push(DatasetSummary {
                name: manifest.dataset_name().unwrap_or(&tag).to_string(),
                tag,
                digest,
                size: manifest.size,
            });
        }
        Ok(datasets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn open(temp_dir: &TempDir) -> LocalRegistry {
        let root = temp_dir.path().join("registry");
        LocalRegistry::open(format!("file://{}", root.display()), &root).unwrap()
    }

    fn push(registry: &LocalRegistry, tag: &str, content: &[u8]) -> String {
        registry
            .put_artifact(tag, &Manifest::for_content(content), content)
            .unwrap()
    }

    #[test]
    fn test_layout_and_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let registry = open(&temp_dir);
        let digest = push(&registry, "v1.0.0", b"orders");

        let hex = digest_hex(&digest).unwrap();
        assert!(registry.root().join("blobs/sha256").join(hex).exists());
        assert!(registry.root().join(format!("manifests/sha256/{}.json", hex)).exists());
        assert_eq!(registry.get_manifest("v1.0.0").unwrap().digest, digest);
        assert_eq!(registry.fetch_blob(&digest).unwrap(), b"orders");
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let digest = push(&open(&temp_dir), "v1.0.0", b"orders");
        let reopened = open(&temp_dir);
        reopened.create_tag("v1.0.0-dev", &digest).unwrap();
        assert_eq!(open(&temp_dir).get_artifact_digest("v1.0.0-dev").unwrap(), digest);
    }

    #[test]
    fn test_tampered_blob_detected() {
        let temp_dir = TempDir::new().unwrap();
        let registry = open(&temp_dir);
        let digest = push(&registry, "v1.0.0", b"orders");
        fs::write(registry.root().join("blobs/sha256").join(digest_hex(&digest).unwrap()), b"x").unwrap();
        assert!(matches!(
            registry.fetch_blob("v1.0.0"),
            Err(RegistryError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_update_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let registry = open(&temp_dir);
        let one = push(&registry, "v1.0.0", b"one");
        let two = push(&registry, "v2.0.0", b"two");

        registry.update_tag("latest-dev", None, &one).unwrap();
        assert!(matches!(
            registry.update_tag("latest-dev", Some(two.as_str()), &one),
            Err(RegistryError::Conflict { .. })
        ));
        registry.update_tag("latest-dev", Some(one.as_str()), &two).unwrap();
        assert!(registry.delete_tag("latest-dev").unwrap());
        assert!(!registry.delete_tag("latest-dev").unwrap());
        assert!(registry.get_artifact_digest("latest-dev").unwrap_err().is_not_found());
    }

    #[test]
    fn test_lock_timeout_maps_to_transient_timeout() {
        use oci_promote_resilience::Classify;

        let temp_dir = TempDir::new().unwrap();
        let registry = open(&temp_dir).with_lock_timeout(Duration::from_millis(50));
        let digest = push(&registry, "v1.0.0", b"one");

        let _held = CacheLock::acquire(registry.root(), Duration::from_secs(1)).unwrap();
        let err = registry.create_tag("v1.0.0-dev", &digest).unwrap_err();
        assert!(matches!(err, RegistryError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_concurrent_create_tag_single_winner() {
        let temp_dir = TempDir::new().unwrap();
        let registry = Arc::new(open(&temp_dir));
        let digest = push(&registry, "v1.0.0", b"one");
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                let digest = digest.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.create_tag("v1.0.0-prod", &digest).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("Thread panicked"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_list_datasets_uses_annotations() {
        let temp_dir = TempDir::new().unwrap();
        let registry = open(&temp_dir);
        let manifest = Manifest::for_content(b"x").with_annotation(super::super::annotations::DATASET, "orders");
        registry.put_artifact("v1.0.0", &manifest, b"x").unwrap();
        let datasets = registry.list_datasets().unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].name, "orders");
    }
}
