//! Ed25519 artifact signatures with pinned public keys.
//!
//! A signature is a base64 Ed25519 signature over the UTF-8 bytes of the
//! artifact digest (`sha256:<hex>`), stored in the
//! `io.dataplatform.signature` manifest annotation.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use oci_promote_cache::compute_digest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use super::{SignatureVerifier, VerificationResult};
use crate::registry::{annotations, Manifest};

/// Signature algorithm identifier
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// Errors from key handling
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

/// Result type for signing operations
pub type SigningResult<T> = Result<T, SigningError>;

/// A trusted public key as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKey {
    /// Base64 Ed25519 public key
    pub public_key: String,
    /// Expected SHA-256 fingerprint of the key, checked at load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Verifier holding trusted keys indexed by fingerprint.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    keys: BTreeMap<String, VerifyingKey>,
}

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured keys, rejecting any whose fingerprint does not
    /// match its pin.
    pub fn from_trusted(trusted: &[TrustedKey]) -> SigningResult<Self> {
        let mut verifier = Self::new();
        for key in trusted {
            let verifying_key = decode_verifying_key(&key.public_key)?;
            if let Some(pinned) = &key.fingerprint {
                let actual = compute_key_fingerprint(&verifying_key);
                if !actual.eq_ignore_ascii_case(pinned) {
                    return Err(SigningError::FingerprintMismatch {
                        expected: pinned.clone(),
                        actual,
                    });
                }
            }
            verifier.add_key(verifying_key);
        }
        Ok(verifier)
    }

    pub fn with_key(mut self, key: VerifyingKey) -> Self {
        self.add_key(key);
        self
    }

    pub fn add_key(&mut self, key: VerifyingKey) {
        self.keys.insert(compute_key_fingerprint(&key), key);
    }

    pub fn fingerprints(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, content: &[u8], metadata: &Manifest, artifact_ref: &str) -> VerificationResult {
        let actual = compute_digest(content);
        if actual != metadata.digest {
            return VerificationResult::failed(format!(
                "content of {} hashes to {}, manifest declares {}",
                artifact_ref, actual, metadata.digest
            ));
        }

        let Some(encoded) = metadata.annotation(annotations::SIGNATURE) else {
            return VerificationResult::unsigned();
        };
        let signature = match STANDARD
            .decode(encoded)
            .map_err(SigningError::from)
            .and_then(|bytes| Signature::from_slice(&bytes).map_err(|e| SigningError::InvalidSignature(e.to_string())))
        {
            Ok(signature) => signature,
            Err(e) => return VerificationResult::failed(format!("{}: {}", artifact_ref, e)),
        };

        if self.keys.is_empty() {
            return VerificationResult::failed("no trusted signing keys configured");
        }

        for (fingerprint, key) in &self.keys {
            if key.verify(metadata.digest.as_bytes(), &signature).is_ok() {
                debug!(artifact = artifact_ref, fingerprint = %fingerprint, "signature verified");
                let signer = metadata.annotation(annotations::SIGNER).unwrap_or(fingerprint);
                return VerificationResult::verified(signer, fingerprint.clone());
            }
        }
        VerificationResult::failed(format!(
            "signature on {} does not match any of {} trusted key(s)",
            artifact_ref,
            self.keys.len()
        ))
    }
}

/// Sign `manifest.digest` and record the signature and signer as annotations.
pub fn sign_manifest(manifest: Manifest, key: &SigningKey, signer: &str) -> Manifest {
    let signature = key.sign(manifest.digest.as_bytes());
    manifest
        .with_annotation(annotations::SIGNATURE, STANDARD.encode(signature.to_bytes()))
        .with_annotation(annotations::SIGNER, signer)
        .with_annotation(annotations::ISSUER, compute_key_fingerprint(&key.verifying_key()))
}

/// Compute SHA-256 fingerprint of an Ed25519 public key
pub fn compute_key_fingerprint(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new Ed25519 keypair
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut rand::thread_rng())
}

/// Encode a signing key to base64 for storage
pub fn encode_signing_key(key: &SigningKey) -> String {
    STANDARD.encode(key.to_bytes())
}

/// Decode a signing key from base64
pub fn decode_signing_key(encoded: &str) -> SigningResult<SigningKey> {
    let bytes = STANDARD.decode(encoded.trim())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Encode a verifying key to base64 for storage
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.as_bytes())
}

/// Decode a verifying key from base64
pub fn decode_verifying_key(encoded: &str) -> SigningResult<VerifyingKey> {
    let bytes = STANDARD.decode(encoded.trim())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SigningError::InvalidKey(e.to_string()))
}
