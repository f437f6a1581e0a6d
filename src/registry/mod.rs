//! Registry client contract and bundled implementations.
//!
//! The promotion core talks to registries only through [`RegistryClient`].
//! [`LocalRegistry`] stores artifacts in a directory and backs `file://`
//! URIs. [`MemoryRegistry`] keeps everything in memory and supports failure
//! injection for tests. [`ResilientRegistry`] wraps either with retry and a
//! circuit breaker.

mod failure;
mod local;
pub mod manifest;
mod memory;
mod resilient;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use oci_promote_resilience::{Classify, TransientKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use failure::{FailureConfig, FailureInjector, InjectedFailure, RegistryOp};
pub use local::LocalRegistry;
pub use manifest::{annotations, Manifest, ARTIFACT_MEDIA_TYPE};
pub use memory::MemoryRegistry;
pub use resilient::{GuardedResult, ResilientRegistry};

/// Registry result type
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("registry timed out: {0}")]
    Timeout(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tag {tag} already exists at {existing_digest}")]
    TagExists { tag: String, existing_digest: String },

    #[error("tag {tag} changed concurrently: expected {}, found {}", .expected.as_deref().unwrap_or("<absent>"), .actual.as_deref().unwrap_or("<absent>"))]
    Conflict {
        tag: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("content for {expected} hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("registry I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> RegistryError {
        let path = path.into();
        move |source| RegistryError::Io { path, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

impl Classify for RegistryError {
    fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            RegistryError::ConnectionRefused(_) => Some(TransientKind::Connection),
            RegistryError::Timeout(_) => Some(TransientKind::Timeout),
            RegistryError::Unavailable(_) => Some(TransientKind::Unavailable),
            _ => None,
        }
    }
}

/// One entry of [`RegistryClient::list_datasets`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub name: String,
    pub tag: String,
    pub digest: String,
    pub size: u64,
}

/// Operations the promotion core needs from an OCI registry.
///
/// A `reference` is either a tag or a `sha256:` digest.
pub trait RegistryClient: Send + Sync {
    /// URI identifying this registry. Breakers are keyed by it.
    fn uri(&self) -> &str;

    fn get_manifest(&self, reference: &str) -> RegistryResult<Manifest>;

    fn get_artifact_digest(&self, reference: &str) -> RegistryResult<String>;

    fn fetch_blob(&self, reference: &str) -> RegistryResult<Vec<u8>>;

    /// Create `tag` pointing at `digest` in one atomic step.
    ///
    /// Fails with [`RegistryError::TagExists`] if the tag is already present,
    /// whatever digest it points at.
    fn create_tag(&self, tag: &str, digest: &str) -> RegistryResult<String>;

    /// Repoint `tag` to `digest` if it currently points at `expected`
    /// (`None` = the tag must not exist).
    fn update_tag(&self, tag: &str, expected: Option<&str>, digest: &str) -> RegistryResult<()>;

    /// Returns whether the tag existed.
    fn delete_tag(&self, tag: &str) -> RegistryResult<bool>;

    /// Store an artifact and point `tag` at it, replacing any previous value.
    fn put_artifact(&self, tag: &str, manifest: &Manifest, blob: &[u8]) -> RegistryResult<String>;

    fn list_datasets(&self) -> RegistryResult<Vec<DatasetSummary>>;

    /// Replicate `tag` into `target`. Returns the digest `target` stored.
    fn copy_tag(&self, tag: &str, target: &dyn RegistryClient) -> RegistryResult<String> {
        let manifest = self.get_manifest(tag)?;
        let blob = self.fetch_blob(tag)?;
        target.put_artifact(tag, &manifest, &blob)
    }
}

/// Host part of a registry URI, used in operator-facing messages.
///
/// `https://registry.example.com/data` gives `registry.example.com`;
/// `file:///srv/registry` gives `/srv/registry`.
pub fn registry_host(uri: &str) -> &str {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    if rest.starts_with('/') {
        return rest;
    }
    rest.split('/').next().unwrap_or(rest)
}

/// Open the registry behind `uri`. Only `file://` URIs are supported.
///
/// `lock_timeout` bounds how long tag writes wait for the registry lock.
pub fn open_registry(uri: &str, lock_timeout: Duration) -> RegistryResult<Arc<dyn RegistryClient>> {
    match uri.strip_prefix("file://") {
        Some(path) if !path.is_empty() => Ok(Arc::new(LocalRegistry::open(uri, path)?.with_lock_timeout(lock_timeout))),
        _ => Err(RegistryError::InvalidReference(format!(
            "unsupported registry URI '{}': expected file://<path>",
            uri
        ))),
    }
}
