//! Artifact signature verification.
//!
//! The promotion controller only sees [`SignatureVerifier`]. The bundled
//! [`Ed25519Verifier`] checks a detached Ed25519 signature over the artifact
//! digest against a set of pinned public keys.

mod ed25519;

use serde::{Deserialize, Serialize};

use crate::registry::Manifest;

pub use ed25519::{
    compute_key_fingerprint, decode_signing_key, decode_verifying_key, encode_signing_key, encode_verifying_key,
    generate_keypair, sign_manifest, Ed25519Verifier, SigningError, SigningResult, TrustedKey, SIGNATURE_ALGORITHM,
};

/// Outcome of a signature check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Failed,
    /// The artifact carries no signature at all
    Unsigned,
}

/// What a verifier found out about one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub rekor_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl VerificationResult {
    pub fn verified(signer_identity: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::Verified,
            signer_identity: Some(signer_identity.into()),
            issuer: Some(issuer.into()),
            rekor_verified: false,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::Failed,
            signer_identity: None,
            issuer: None,
            rekor_verified: false,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn unsigned() -> Self {
        Self {
            status: VerificationStatus::Unsigned,
            signer_identity: None,
            issuer: None,
            rekor_verified: false,
            failure_reason: Some("artifact is not signed".to_string()),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}

/// Checks the signature of an artifact before it is promoted.
pub trait SignatureVerifier: Send + Sync {
    /// `content` is the artifact blob, `metadata` its manifest and
    /// `artifact_ref` the reference it was resolved from (for messages).
    fn verify(&self, content: &[u8], metadata: &Manifest, artifact_ref: &str) -> VerificationResult;
}
