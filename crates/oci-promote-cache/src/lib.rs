//! Content-addressed local cache for OCI artifacts.
//!
//! Blobs are stored once per digest under `sha256/<hex>/`. A JSON index maps
//! digests to [`CacheEntry`] metadata and tracks the total size. Entries under
//! mutable tags expire after a TTL; semver and digest tags never do. When a
//! `put` pushes the cache past its size limit, expired entries are evicted
//! first and then the least recently used.
//!
//! All mutations serialize on an advisory lock in the cache directory, so any
//! number of processes can share one cache.

pub mod clock;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod fsutil;
pub mod lock;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{compute_digest, digest_hex, is_immutable_tag, CacheEntry, CacheIndex, DIGEST_PREFIX};
pub use error::{CacheError, CacheResult};
pub use eviction::{bytes_to_free, plan_eviction, EvictionPlan, EvictionReason, EvictionReport, EVICTION_BUFFER};
pub use fsutil::write_atomic;
pub use lock::{CacheLock, LockError};
pub use store::{CacheConfig, CacheStats, CacheStore};
