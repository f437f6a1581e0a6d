//! OCI artifact promotion.
//!
//! Moves versioned artifacts through an ordered chain of environments
//! (`dev` → `staging` → `prod` by default) by creating immutable
//! `<tag>-<env>` tags in an OCI registry. Every promotion passes
//! environment gates, signature verification and operator authorization,
//! and leaves an audit record behind.
//!
//! Registry calls are wrapped in retry with exponential backoff and a
//! per-registry circuit breaker (`oci-promote-resilience`). Promoted
//! artifacts can be kept in a content-addressed local cache
//! (`oci-promote-cache`).

pub mod auth;
pub mod config;
pub mod error;
pub mod gates;
pub mod logging;
pub mod promotion;
pub mod registry;
pub mod verify;

pub use auth::{AuthorizationChecker, AuthorizationConfig, AuthorizationResult, Operator, SeparationOfDutiesResult};
pub use config::{ConfigError, ConfigLoader, EnvironmentConfig, PromotionConfig};
pub use error::{ExitCode, PromotionError, PromotionResult};
pub use gates::{GateResult, GateRunner, GateSpec, GateStatus, StandardGateRunner};
pub use promotion::{
    FileRecordStore, MemoryRecordStore, PromotionController, PromotionRecord, RecordStore, RollbackImpact,
    RollbackRecord,
};
pub use registry::{open_registry, LocalRegistry, Manifest, MemoryRegistry, RegistryClient, RegistryError};
pub use verify::{Ed25519Verifier, SignatureVerifier, VerificationResult, VerificationStatus};
