//! Persistence for promotion and rollback records.
//!
//! ```text
//! <records_dir>/
//! ├── promotions/<promotion_id>.json
//! └── rollbacks/<rollback_id>.json
//! ```
//!
//! Records are written once with write-temp-then-rename and never modified.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use oci_promote_cache::write_atomic;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::record::{PromotionRecord, RollbackRecord};

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from record persistence
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("record {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("refusing to persist dry-run promotion {0}")]
    DryRun(String),
}

/// Where the controller keeps its records.
pub trait RecordStore: Send + Sync {
    fn save_promotion(&self, record: &PromotionRecord) -> StoreResult<()>;

    fn save_rollback(&self, record: &RollbackRecord) -> StoreResult<()>;

    /// Most recent promotion of `tag` into `environment`.
    fn latest_promotion(&self, tag: &str, environment: &str) -> StoreResult<Option<PromotionRecord>> {
        Ok(self
            .promotions_for_env(environment)?
            .into_iter()
            .filter(|r| r.artifact_tag == tag)
            .last())
    }

    /// Promotions into `environment`, oldest first.
    fn promotions_for_env(&self, environment: &str) -> StoreResult<Vec<PromotionRecord>>;

    /// Rollbacks within `environment`, oldest first.
    fn rollbacks_for_env(&self, environment: &str) -> StoreResult<Vec<RollbackRecord>>;
}

fn sort_promotions(records: &mut [PromotionRecord]) {
    records.sort_by(|a, b| {
        a.promoted_at
            .cmp(&b.promoted_at)
            .then_with(|| a.promotion_id.cmp(&b.promotion_id))
    });
}

fn sort_rollbacks(records: &mut [RollbackRecord]) {
    records.sort_by(|a, b| {
        a.rolled_back_at
            .cmp(&b.rolled_back_at)
            .then_with(|| a.rollback_id.cmp(&b.rollback_id))
    });
}

/// One JSON file per record.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    const PROMOTIONS: &'static str = "promotions";
    const ROLLBACKS: &'static str = "rollbacks";

    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join(Self::PROMOTIONS), root.join(Self::ROLLBACKS)] {
            fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir.clone(), source })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write<T: Serialize>(&self, kind: &str, id: &str, record: &T) -> StoreResult<()> {
        let path = self.root.join(kind).join(format!("{}.json", id));
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes).map_err(|source| StoreError::Io { path, source })
    }

    fn read_all<T: DeserializeOwned>(&self, kind: &str) -> StoreResult<Vec<T>> {
        let dir = self.root.join(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            match serde_json::from_slice(&bytes) {
                Ok(record) => records.push(record),
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "skipping unreadable record");
                }
            }
        }
        Ok(records)
    }
}

impl RecordStore for FileRecordStore {
    fn save_promotion(&self, record: &PromotionRecord) -> StoreResult<()> {
        if record.dry_run {
            return Err(StoreError::DryRun(record.promotion_id.clone()));
        }
        self.write(Self::PROMOTIONS, &record.promotion_id, record)
    }

    fn save_rollback(&self, record: &RollbackRecord) -> StoreResult<()> {
        self.write(Self::ROLLBACKS, &record.rollback_id, record)
    }

    fn promotions_for_env(&self, environment: &str) -> StoreResult<Vec<PromotionRecord>> {
        let mut records: Vec<PromotionRecord> = self
            .read_all::<PromotionRecord>(Self::PROMOTIONS)?
            .into_iter()
            .filter(|r| r.target_environment == environment)
            .collect();
        sort_promotions(&mut records);
        Ok(records)
    }

    fn rollbacks_for_env(&self, environment: &str) -> StoreResult<Vec<RollbackRecord>> {
        let mut records: Vec<RollbackRecord> = self
            .read_all::<RollbackRecord>(Self::ROLLBACKS)?
            .into_iter()
            .filter(|r| r.environment == environment)
            .collect();
        sort_rollbacks(&mut records);
        Ok(records)
    }
}

#[derive(Debug, Default)]
struct MemoryRecords {
    promotions: Vec<PromotionRecord>,
    rollbacks: Vec<RollbackRecord>,
}

/// Records kept in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryRecords>,
    fail_saves: Mutex<bool>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, MemoryRecords> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent save fail with an I/O error.
    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    fn check_save(&self) -> StoreResult<()> {
        if *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(StoreError::Io {
                path: PathBuf::from("<memory>"),
                source: io::Error::new(io::ErrorKind::Other, "injected save failure"),
            });
        }
        Ok(())
    }

    pub fn promotion_count(&self) -> usize {
        self.records().promotions.len()
    }
}

impl RecordStore for MemoryRecordStore {
    fn save_promotion(&self, record: &PromotionRecord) -> StoreResult<()> {
        if record.dry_run {
            return Err(StoreError::DryRun(record.promotion_id.clone()));
        }
        self.check_save()?;
        self.records().promotions.push(record.clone());
        Ok(())
    }

    fn save_rollback(&self, record: &RollbackRecord) -> StoreResult<()> {
        self.check_save()?;
        self.records().rollbacks.push(record.clone());
        Ok(())
    }

    fn promotions_for_env(&self, environment: &str) -> StoreResult<Vec<PromotionRecord>> {
        let mut records: Vec<PromotionRecord> = self
            .records()
            .promotions
            .iter()
            .filter(|r| r.target_environment == environment)
            .cloned()
            .collect();
        sort_promotions(&mut records);
        Ok(records)
    }

    fn rollbacks_for_env(&self, environment: &str) -> StoreResult<Vec<RollbackRecord>> {
        let mut records: Vec<RollbackRecord> = self
            .records()
            .rollbacks
            .iter()
            .filter(|r| r.environment == environment)
            .cloned()
            .collect();
        sort_rollbacks(&mut records);
        Ok(records)
    }
}
