//! Size-pressure eviction.
//!
//! After every `put` that leaves the index above the configured maximum, the
//! store frees `EVICTION_BUFFER * (total_size - max_size)` bytes:
//! expired entries go first (earliest expiry first), then the least recently
//! accessed. Freeing slightly more than the overage keeps a burst of puts
//! from evicting on every call.

use chrono::{DateTime, Utc};

use crate::entry::{CacheEntry, CacheIndex};

/// Multiplier applied to the overage when computing how much to free.
pub const EVICTION_BUFFER: f64 = 1.1;

/// Why an entry was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    LeastRecentlyUsed,
}

/// Entries selected for removal, in removal order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionPlan {
    pub victims: Vec<(String, EvictionReason)>,
    pub bytes_to_free: u64,
    pub bytes_planned: u64,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}

/// Outcome of applying a plan.
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub evicted: usize,
    pub expired_evicted: usize,
    pub bytes_reclaimed: u64,
    /// Non-fatal failures deleting entry directories.
    pub errors: Vec<String>,
}

impl EvictionReport {
    pub(crate) fn record(&mut self, entry: &CacheEntry, reason: EvictionReason) {
        self.evicted += 1;
        if reason == EvictionReason::Expired {
            self.expired_evicted += 1;
        }
        self.bytes_reclaimed += entry.size;
    }

    pub fn merge(&mut self, other: &EvictionReport) {
        self.evicted += other.evicted;
        self.expired_evicted += other.expired_evicted;
        self.bytes_reclaimed += other.bytes_reclaimed;
        self.errors.extend(other.errors.iter().cloned());
    }
}

/// Bytes to free for a cache at `total_size` with limit `max_size`.
pub fn bytes_to_free(total_size: u64, max_size: u64) -> u64 {
    if total_size <= max_size {
        return 0;
    }
    ((total_size - max_size) as f64 * EVICTION_BUFFER).ceil() as u64
}

/// Choose victims so that at least `bytes_to_free` bytes are released.
///
/// Returns an empty plan when the index is within its limit. The plan may
/// fall short of the target if the cache runs out of entries.
pub fn plan_eviction(index: &CacheIndex, max_size: u64, now: DateTime<Utc>) -> EvictionPlan {
    let target = bytes_to_free(index.total_size(), max_size);
    let mut plan = EvictionPlan {
        bytes_to_free: target,
        ..Default::default()
    };
    if target == 0 {
        return plan;
    }

    let mut expired: Vec<&CacheEntry> = index.entries().filter(|e| e.is_expired_at(now)).collect();
    expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.digest.cmp(&b.digest)));

    let mut live: Vec<&CacheEntry> = index.entries().filter(|e| !e.is_expired_at(now)).collect();
    live.sort_by(|a, b| {
        a.last_accessed
            .cmp(&b.last_accessed)
            .then_with(|| a.digest.cmp(&b.digest))
    });

    let candidates = expired
        .into_iter()
        .map(|e| (e, EvictionReason::Expired))
        .chain(live.into_iter().map(|e| (e, EvictionReason::LeastRecentlyUsed)));

    for (entry, reason) in candidates {
        if plan.bytes_planned >= target {
            break;
        }
        plan.bytes_planned += entry.size;
        plan.victims.push((entry.digest.clone(), reason));
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;

    fn entry(digest: &str, size: u64, accessed: DateTime<Utc>, expires: Option<DateTime<Utc>>) -> CacheEntry {
        CacheEntry {
            digest: digest.to_string(),
            tag: digest.to_string(),
            registry: "r".to_string(),
            pulled_at: accessed,
            expires_at: expires,
            size,
            path: PathBuf::from("/tmp"),
            last_accessed: accessed,
        }
    }

    #[test]
    fn test_bytes_to_free_includes_buffer() {
        assert_eq!(bytes_to_free(100, 100), 0);
        assert_eq!(bytes_to_free(50, 100), 0);
        assert_eq!(bytes_to_free(200, 100), 110);
        assert_eq!(bytes_to_free(101, 100), 2);
    }

    #[test]
    fn test_no_plan_under_limit() {
        let now = Utc::now();
        let mut index = CacheIndex::new(now);
        index.insert(entry("a", 10, now, None));
        assert!(plan_eviction(&index, 100, now).is_empty());
    }

    #[test]
    fn test_expired_entries_go_first() {
        let now = Utc::now();
        let mut index = CacheIndex::new(now);
        index.insert(entry("old-lru", 40, now - Duration::hours(5), None));
        index.insert(entry("expired", 40, now, Some(now - Duration::minutes(1))));
        index.insert(entry("fresh", 40, now, None));

        // 120 total, limit 100 -> free 22
        let plan = plan_eviction(&index, 100, now);
        assert_eq!(plan.victims, vec![("expired".to_string(), EvictionReason::Expired)]);
    }

    #[test]
    fn test_lru_order_when_nothing_expired() {
        let now = Utc::now();
        let mut index = CacheIndex::new(now);
        index.insert(entry("c", 40, now, None));
        index.insert(entry("a", 40, now - Duration::hours(2), None));
        index.insert(entry("b", 40, now - Duration::hours(1), None));

        // 120 total, limit 50 -> free 77: needs two entries
        let plan = plan_eviction(&index, 50, now);
        let order: Vec<&str> = plan.victims.iter().map(|(d, _)| d.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert!(plan.bytes_planned >= plan.bytes_to_free);
    }

    #[test]
    fn test_plan_bounded_by_available_entries() {
        let now = Utc::now();
        let mut index = CacheIndex::new(now);
        index.insert(entry("only", 500, now, None));

        let plan = plan_eviction(&index, 100, now);
        assert_eq!(plan.victims.len(), 1);
        assert_eq!(plan.bytes_planned, 500);
    }

    #[test]
    fn test_report_merge() {
        let mut first = EvictionReport {
            evicted: 2,
            expired_evicted: 1,
            bytes_reclaimed: 100,
            errors: vec!["e1".to_string()],
        };
        let second = EvictionReport {
            evicted: 1,
            expired_evicted: 0,
            bytes_reclaimed: 50,
            errors: vec!["e2".to_string()],
        };
        first.merge(&second);
        assert_eq!(first.evicted, 3);
        assert_eq!(first.expired_evicted, 1);
        assert_eq!(first.bytes_reclaimed, 150);
        assert_eq!(first.errors.len(), 2);
    }
}
