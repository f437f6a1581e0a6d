use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::lock::LockError;

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("invalid digest '{0}': expected sha256:<64 hex chars>")]
    InvalidDigest(String),

    #[error("content rejected: expected {expected}, content hashes to {actual}")]
    ContentRejected { expected: String, actual: String },

    #[error("cached blob for {digest} hashes to {actual} ({path}); entry removed")]
    DigestMismatch {
        digest: String,
        actual: String,
        path: PathBuf,
    },

    #[error("corrupt cache index {path}: {source}")]
    CorruptIndex {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize cache index: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn io(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> CacheError {
        let path = path.to_path_buf();
        move |source| CacheError::Io { op, path, source }
    }

    /// Whether this is a data-integrity failure on read.
    pub fn is_digest_mismatch(&self) -> bool {
        matches!(self, CacheError::DigestMismatch { .. })
    }
}
