//! Promotion and rollback of artifacts between environments.
//!
//! An artifact `tag` promoted into environment `env` is addressed by the
//! immutable tag `<tag>-<env>`. The mutable tag `latest-<env>` always points
//! at the most recently promoted digest.

pub mod controller;
pub mod impact;
pub mod record;
pub mod store;

pub use controller::{EnvironmentHistory, PromotionController};
pub use impact::{analyze_impact, semver_major};
pub use record::{
    generate_id, generate_trace_id, PromotionRecord, Recommendation, RegistrySyncStatus, RollbackImpact,
    RollbackRecord,
};
pub use store::{FileRecordStore, MemoryRecordStore, RecordStore, StoreError, StoreResult};

/// Immutable tag for `tag` in `env`.
pub fn env_tag(tag: &str, env: &str) -> String {
    format!("{}-{}", tag, env)
}

/// Mutable tag tracking the newest promotion into `env`.
pub fn latest_tag(env: &str) -> String {
    format!("latest-{}", env)
}
