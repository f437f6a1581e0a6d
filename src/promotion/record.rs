//! Promotion and rollback records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gates::GateResult;

/// Generate a promotion or rollback ID (lowercase ULID).
pub fn generate_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// Generate a trace ID (32 hex chars).
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Replication outcome for one secondary registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySyncStatus {
    pub registry_uri: String,
    pub synced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A successful or dry-run promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub promotion_id: String,
    pub artifact_digest: String,
    pub artifact_tag: String,
    pub source_environment: String,
    pub target_environment: String,
    pub gate_results: Vec<GateResult>,
    pub signature_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_identity: Option<String>,
    pub operator: String,
    pub promoted_at: DateTime<Utc>,
    pub dry_run: bool,
    pub trace_id: String,
    pub authorization_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_via: Option<String>,
    /// What `latest-<env>` pointed at before this promotion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_digest: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub registry_sync_status: Vec<RegistrySyncStatus>,
}

/// A completed rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub rollback_id: String,
    pub artifact_tag: String,
    pub environment: String,
    /// Digest that was live before the rollback
    pub previous_digest: String,
    /// Digest `latest-<env>` points at afterwards
    pub restored_digest: String,
    pub reason: String,
    pub operator: String,
    pub rolled_back_at: DateTime<Utc>,
    pub trace_id: String,
    pub authorization_passed: bool,
    /// Promotion this rollback reverted
    pub promotion_id: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Suggested course of action for a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Proceed,
    ProceedWithCaution,
    CoordinateWithConsumers,
    NoPreviousVersion,
}

/// Read-only assessment of what a rollback would change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackImpact {
    pub artifact_tag: String,
    pub environment: String,
    pub current_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    /// Schema fields present now that the restored version lacks
    pub removed_fields: Vec<String>,
    pub major_version_change: bool,
    pub breaking_change: bool,
    pub affected_products: Vec<String>,
    pub recommendation: Recommendation,
}
