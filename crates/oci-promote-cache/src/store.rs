//! The file-backed cache store.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/
//! ├── .lock                       # flock target, never holds data
//! ├── index.json                  # CacheIndex, replaced atomically
//! └── sha256/<hex>/
//!     ├── blob
//!     └── manifest.json           # optional
//! ```
//!
//! Every mutating operation holds the directory lock for the full
//! load-modify-save cycle. Read-only views (`stats`, `entries`) skip the lock
//! and rely on `index.json` only ever being replaced by rename.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::clock::{Clock, SystemClock};
use crate::entry::{compute_digest, digest_hex, is_immutable_tag, CacheEntry, CacheIndex};
use crate::error::{CacheError, CacheResult};
use crate::eviction::{plan_eviction, EvictionReport};
use crate::fsutil;
use crate::lock::CacheLock;

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    /// Maximum total blob bytes (0 = unlimited).
    pub max_size_bytes: u64,
    /// Lifetime of entries stored under mutable tags.
    pub ttl_hours: u64,
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            cache_dir: PathBuf::from(home).join(".cache/oci-promote/artifacts"),
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            ttl_hours: 24,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    pub fn at(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_size(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    pub fn with_ttl_hours(mut self, ttl_hours: u64) -> Self {
        self.ttl_hours = ttl_hours;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Point-in-time summary of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_dir: PathBuf,
    pub entries: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub utilization_percent: f64,
    pub expired: usize,
    pub immutable: usize,
    pub mutable: usize,
    pub oldest_pull: Option<DateTime<Utc>>,
    pub newest_pull: Option<DateTime<Utc>>,
    /// Bytes actually present under the blob tree, including orphans.
    pub disk_bytes: u64,
    pub last_updated: DateTime<Utc>,
}

/// Content-addressed artifact cache.
///
/// Clones share the same directory and serialize on its lock.
#[derive(Clone)]
pub struct CacheStore {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub const INDEX_FILENAME: &'static str = "index.json";
    pub const BLOB_ROOT: &'static str = "sha256";

    /// Open (creating if needed) a cache using the system clock.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        fs::create_dir_all(&config.cache_dir)
            .map_err(CacheError::io("create directory", &config.cache_dir))?;
        Ok(Self { config, clock })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.cache_dir
    }

    fn index_path(&self) -> PathBuf {
        self.config.cache_dir.join(Self::INDEX_FILENAME)
    }

    fn entry_dir(&self, hex: &str) -> PathBuf {
        self.config.cache_dir.join(Self::BLOB_ROOT).join(hex)
    }

    fn lock(&self) -> CacheResult<CacheLock> {
        Ok(CacheLock::acquire(&self.config.cache_dir, self.config.lock_timeout)?)
    }

    fn load_index(&self) -> CacheResult<CacheIndex> {
        let path = self.index_path();
        match fs::read(&path) {
            Ok(bytes) => {
                let mut index: CacheIndex = serde_json::from_slice(&bytes)
                    .map_err(|source| CacheError::CorruptIndex { path: path.clone(), source })?;
                if index.reconcile() {
                    warn!(path = %path.display(), "cache index total_size drifted; recomputed");
                }
                Ok(index)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheIndex::new(self.clock.now())),
            Err(e) => Err(CacheError::io("read", &path)(e)),
        }
    }

    fn save_index(&self, index: &mut CacheIndex) -> CacheResult<()> {
        index.touch(self.clock.now());
        let bytes = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.index_path(), &bytes)
    }

    /// Drop an entry from the index and delete its directory.
    fn discard(&self, index: &mut CacheIndex, digest: &str) -> Option<CacheEntry> {
        let entry = index.remove(digest)?;
        if let Err(e) = fs::remove_dir_all(&entry.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %entry.path.display(), error = %e, "failed to delete cache entry directory");
            }
        }
        Some(entry)
    }

    fn bump(index: &mut CacheIndex, digest: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entry = index.get_mut(digest)?;
        entry.last_accessed = now;
        Some(entry.clone())
    }

    /// Look up a live entry by registry and tag.
    ///
    /// Expired entries read as misses but stay on disk until
    /// [`cleanup_expired`](Self::cleanup_expired) or eviction removes them.
    pub fn get(&self, registry: &str, tag: &str) -> CacheResult<Option<CacheEntry>> {
        let _lock = self.lock()?;
        let mut index = self.load_index()?;
        let now = self.clock.now();

        let digest = match index.find(registry, tag) {
            Some(e) if e.is_expired_at(now) => {
                debug!(registry, tag, digest = %e.digest, "cache entry expired");
                return Ok(None);
            }
            Some(e) => e.digest.clone(),
            None => return Ok(None),
        };

        let entry = Self::bump(&mut index, &digest, now);
        self.save_index(&mut index)?;
        Ok(entry)
    }

    /// Like [`get`](Self::get) but also returns the verified blob.
    ///
    /// An unreadable blob removes the entry and reads as a miss. A blob whose
    /// hash no longer matches removes the entry and fails with
    /// [`CacheError::DigestMismatch`].
    pub fn get_with_content(
        &self,
        registry: &str,
        tag: &str,
    ) -> CacheResult<Option<(CacheEntry, Vec<u8>)>> {
        let _lock = self.lock()?;
        let mut index = self.load_index()?;
        let now = self.clock.now();

        let entry = match index.find(registry, tag) {
            Some(e) if !e.is_expired_at(now) => e.clone(),
            _ => return Ok(None),
        };

        let blob_path = entry.blob_path();
        let content = match fs::read(&blob_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %blob_path.display(), error = %e, "unreadable cache blob; removing entry");
                self.discard(&mut index, &entry.digest);
                self.save_index(&mut index)?;
                return Ok(None);
            }
        };

        let actual = compute_digest(&content);
        if actual != entry.digest {
            warn!(digest = %entry.digest, actual = %actual, "cache corruption detected; removing entry");
            self.discard(&mut index, &entry.digest);
            self.save_index(&mut index)?;
            return Err(CacheError::DigestMismatch {
                digest: entry.digest,
                actual,
                path: blob_path,
            });
        }

        let entry = Self::bump(&mut index, &entry.digest, now).unwrap_or(entry);
        self.save_index(&mut index)?;
        Ok(Some((entry, content)))
    }

    /// Store verified content under `digest`.
    ///
    /// Entries for mutable tags expire after `ttl_hours`; semver and digest
    /// tags never expire. An older entry under the same registry and tag is
    /// replaced. Eviction runs before the index is written back.
    pub fn put(
        &self,
        digest: &str,
        tag: &str,
        registry: &str,
        content: &[u8],
        manifest: Option<&[u8]>,
    ) -> CacheResult<CacheEntry> {
        let hex = digest_hex(digest)
            .ok_or_else(|| CacheError::InvalidDigest(digest.to_string()))?
            .to_string();
        let actual = compute_digest(content);
        if actual != digest {
            return Err(CacheError::ContentRejected {
                expected: digest.to_string(),
                actual,
            });
        }

        let _lock = self.lock()?;
        let mut index = self.load_index()?;
        let now = self.clock.now();

        let dir = self.entry_dir(&hex);
        fs::create_dir_all(&dir).map_err(CacheError::io("create directory", &dir))?;
        write_atomic(&dir.join(CacheEntry::BLOB_FILENAME), content)?;
        if let Some(manifest) = manifest {
            write_atomic(&dir.join(CacheEntry::MANIFEST_FILENAME), manifest)?;
        }

        let expires_at = if is_immutable_tag(tag) {
            None
        } else {
            Some(now + chrono::Duration::hours(self.config.ttl_hours as i64))
        };

        let entry = CacheEntry {
            digest: digest.to_string(),
            tag: tag.to_string(),
            registry: registry.to_string(),
            pulled_at: now,
            expires_at,
            size: content.len() as u64,
            path: dir,
            last_accessed: now,
        };

        for stale in index.superseded_by(registry, tag, digest) {
            debug!(registry, tag, digest = %stale, "replacing superseded cache entry");
            self.discard(&mut index, &stale);
        }
        index.insert(entry.clone());

        let report = self.evict(&mut index, now);
        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                expired = report.expired_evicted,
                bytes = report.bytes_reclaimed,
                total_size = index.total_size(),
                "cache eviction"
            );
        }

        self.save_index(&mut index)?;
        Ok(entry)
    }

    fn evict(&self, index: &mut CacheIndex, now: DateTime<Utc>) -> EvictionReport {
        let mut report = EvictionReport::default();
        if self.config.max_size_bytes == 0 {
            return report;
        }

        let plan = plan_eviction(index, self.config.max_size_bytes, now);
        for (digest, reason) in plan.victims {
            if let Some(entry) = index.remove(&digest) {
                if let Err(e) = fs::remove_dir_all(&entry.path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        report
                            .errors
                            .push(format!("failed to delete {}: {}", entry.path.display(), e));
                    }
                }
                debug!(digest = %entry.digest, ?reason, size = entry.size, "evicted");
                report.record(&entry, reason);
            }
        }
        report
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&self, digest: &str) -> CacheResult<bool> {
        let _lock = self.lock()?;
        let mut index = self.load_index()?;
        let removed = self.discard(&mut index, digest).is_some();
        if removed {
            self.save_index(&mut index)?;
        }
        Ok(removed)
    }

    /// Mark an entry as just used. Returns whether it existed.
    pub fn touch(&self, digest: &str) -> CacheResult<bool> {
        let _lock = self.lock()?;
        let mut index = self.load_index()?;
        let touched = Self::bump(&mut index, digest, self.clock.now()).is_some();
        if touched {
            self.save_index(&mut index)?;
        }
        Ok(touched)
    }

    /// Remove every entry. Returns how many there were.
    pub fn clear(&self) -> CacheResult<usize> {
        let _lock = self.lock()?;
        let mut index = self.load_index()?;
        let drained = index.drain();

        let blob_root = self.config.cache_dir.join(Self::BLOB_ROOT);
        match fs::remove_dir_all(&blob_root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io("remove directory", &blob_root)(e)),
        }

        self.save_index(&mut index)?;
        info!(removed = drained.len(), "cache cleared");
        Ok(drained.len())
    }

    /// Delete expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> CacheResult<usize> {
        let _lock = self.lock()?;
        let mut index = self.load_index()?;
        let now = self.clock.now();

        let expired: Vec<String> = index
            .entries()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.digest.clone())
            .collect();
        for digest in &expired {
            self.discard(&mut index, digest);
        }

        if !expired.is_empty() {
            self.save_index(&mut index)?;
            info!(removed = expired.len(), "expired cache entries removed");
        }
        Ok(expired.len())
    }

    /// Copies of all indexed entries.
    pub fn entries(&self) -> CacheResult<Vec<CacheEntry>> {
        Ok(self.load_index()?.entries().cloned().collect())
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let index = self.load_index()?;
        let now = self.clock.now();

        let expired = index.entries().filter(|e| e.is_expired_at(now)).count();
        let immutable = index.entries().filter(|e| e.is_immutable()).count();
        let max_size = self.config.max_size_bytes;
        let utilization_percent = if max_size == 0 {
            0.0
        } else {
            index.total_size() as f64 / max_size as f64 * 100.0
        };

        let disk_bytes = WalkDir::new(self.config.cache_dir.join(Self::BLOB_ROOT))
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();

        Ok(CacheStats {
            cache_dir: self.config.cache_dir.clone(),
            entries: index.len(),
            total_size: index.total_size(),
            max_size,
            utilization_percent,
            expired,
            immutable,
            mutable: index.len() - immutable,
            oldest_pull: index.entries().map(|e| e.pulled_at).min(),
            newest_pull: index.entries().map(|e| e.pulled_at).max(),
            disk_bytes,
            last_updated: index.last_updated(),
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    fsutil::write_atomic(path, bytes).map_err(CacheError::io("write", path))
}
