//! Cache entries, the persisted index, and digest/tag helpers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix of every digest this cache understands.
pub const DIGEST_PREFIX: &str = "sha256:";

/// One cached artifact, keyed by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub digest: String,
    pub tag: String,
    pub registry: String,
    pub pulled_at: DateTime<Utc>,
    /// Only set for mutable tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub size: u64,
    /// Directory holding `blob` and the optional `manifest.json`.
    pub path: PathBuf,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    /// Blob file name inside the entry directory.
    pub const BLOB_FILENAME: &'static str = "blob";
    /// Manifest file name inside the entry directory.
    pub const MANIFEST_FILENAME: &'static str = "manifest.json";

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if now >= expires)
    }

    pub fn is_immutable(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn blob_path(&self) -> PathBuf {
        self.path.join(Self::BLOB_FILENAME)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(Self::MANIFEST_FILENAME)
    }

    fn matches(&self, registry: &str, tag: &str) -> bool {
        self.registry == registry && self.tag == tag
    }
}

/// The on-disk index of all entries.
///
/// `total_size` always equals the sum of `size` over `entries`; every
/// mutation goes through [`CacheIndex::insert`] or [`CacheIndex::remove`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndex {
    entries: BTreeMap<String, CacheEntry>,
    total_size: u64,
    last_updated: DateTime<Utc>,
}

impl CacheIndex {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            entries: BTreeMap::new(),
            total_size: 0,
            last_updated: now,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, digest: &str) -> Option<&CacheEntry> {
        self.entries.get(digest)
    }

    pub(crate) fn get_mut(&mut self, digest: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(digest)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Insert or replace the entry for its digest, returning the old one.
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_size += entry.size;
        let previous = self.entries.insert(entry.digest.clone(), entry);
        if let Some(ref old) = previous {
            self.total_size = self.total_size.saturating_sub(old.size);
        }
        previous
    }

    pub fn remove(&mut self, digest: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(digest);
        if let Some(ref entry) = removed {
            self.total_size = self.total_size.saturating_sub(entry.size);
        }
        removed
    }

    /// Newest entry (by pull time) stored under `registry` and `tag`.
    pub fn find(&self, registry: &str, tag: &str) -> Option<&CacheEntry> {
        self.entries
            .values()
            .filter(|e| e.matches(registry, tag))
            .max_by_key(|e| e.pulled_at)
    }

    /// Digests stored under `registry`/`tag` other than `keep`.
    pub(crate) fn superseded_by(&self, registry: &str, tag: &str, keep: &str) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.matches(registry, tag) && e.digest != keep)
            .map(|e| e.digest.clone())
            .collect()
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_updated = now;
    }

    /// Recompute `total_size` from the entries. Returns true if it drifted.
    pub(crate) fn reconcile(&mut self) -> bool {
        let actual: u64 = self.entries.values().map(|e| e.size).sum();
        let drifted = actual != self.total_size;
        self.total_size = actual;
        drifted
    }

    pub(crate) fn drain(&mut self) -> Vec<CacheEntry> {
        self.total_size = 0;
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

fn semver_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^v?\d+\.\d+\.\d+").expect("static regex"))
}

fn digest_ref() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(^|@)sha256:[0-9a-f]{64}$").expect("static regex"))
}

/// Whether a tag names content that can never change.
///
/// Semver tags (`v1.2.3`, `1.2.3-rc1`, `v1.2.3-staging`) and digest references
/// are immutable; anything else (`latest`, `nightly`) is mutable and expires.
pub fn is_immutable_tag(tag: &str) -> bool {
    semver_tag().is_match(tag) || digest_ref().is_match(tag)
}

/// `sha256:<hex>` of `content`.
pub fn compute_digest(content: &[u8]) -> String {
    format!("{}{}", DIGEST_PREFIX, hex::encode(Sha256::digest(content)))
}

/// Hex part of a well-formed `sha256:` digest.
pub fn digest_hex(digest: &str) -> Option<&str> {
    let hex = digest.strip_prefix(DIGEST_PREFIX)?;
    let valid = hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    valid.then_some(hex)
}
