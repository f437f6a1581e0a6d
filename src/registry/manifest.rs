//! Artifact manifest and well-known annotations.

use std::collections::BTreeMap;

use oci_promote_cache::compute_digest;
use serde::{Deserialize, Serialize};

/// Default media type for dataset artifacts.
pub const ARTIFACT_MEDIA_TYPE: &str = "application/vnd.dataplatform.dataset.v1";

/// Annotation keys read by gates, verification and impact analysis.
pub mod annotations {
    pub const TITLE: &str = "org.opencontainers.image.title";
    pub const VERSION: &str = "org.opencontainers.image.version";
    pub const DATASET: &str = "io.dataplatform.dataset";
    pub const CONSUMERS: &str = "io.dataplatform.consumers";
    pub const SCHEMA_FIELDS: &str = "io.dataplatform.schema.fields";
    pub const TESTS_PASSED: &str = "io.dataplatform.tests.passed";
    pub const TESTS_TOTAL: &str = "io.dataplatform.tests.total";
    pub const POLICIES: &str = "io.dataplatform.policies";
    pub const SIGNATURE: &str = "io.dataplatform.signature";
    pub const SIGNER: &str = "io.dataplatform.signer";
    pub const ISSUER: &str = "io.dataplatform.issuer";
}

/// Manifest describing a single-blob artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub media_type: String,
    /// `sha256:<hex>` of the content blob
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Manifest for `content` with no annotations.
    pub fn for_content(content: &[u8]) -> Self {
        Self {
            schema_version: 2,
            media_type: ARTIFACT_MEDIA_TYPE.to_string(),
            digest: compute_digest(content),
            size: content.len() as u64,
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// A comma-separated annotation split into trimmed, non-empty items.
    pub fn list_annotation(&self, key: &str) -> Vec<String> {
        self.annotation(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A numeric annotation, if present and parseable.
    pub fn u64_annotation(&self, key: &str) -> Option<u64> {
        self.annotation(key).and_then(|v| v.trim().parse().ok())
    }

    /// Dataset name: the dataset annotation, then the title.
    pub fn dataset_name(&self) -> Option<&str> {
        self.annotation(annotations::DATASET)
            .or_else(|| self.annotation(annotations::TITLE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_content_computes_digest() {
        let manifest = Manifest::for_content(b"hello");
        assert_eq!(manifest.digest, compute_digest(b"hello"));
        assert_eq!(manifest.size, 5);
        assert!(manifest.annotations.is_empty());
    }

    #[test]
    fn test_list_annotation() {
        let manifest = Manifest::for_content(b"x")
            .with_annotation(annotations::CONSUMERS, " billing, ,reporting ,");
        assert_eq!(manifest.list_annotation(annotations::CONSUMERS), vec!["billing", "reporting"]);
        assert!(manifest.list_annotation(annotations::POLICIES).is_empty());
    }

    #[test]
    fn test_dataset_name_falls_back_to_title() {
        let titled = Manifest::for_content(b"x").with_annotation(annotations::TITLE, "orders");
        assert_eq!(titled.dataset_name(), Some("orders"));
        let named = titled.with_annotation(annotations::DATASET, "orders_v2");
        assert_eq!(named.dataset_name(), Some("orders_v2"));
    }

    #[test]
    fn test_u64_annotation() {
        let manifest = Manifest::for_content(b"x")
            .with_annotation(annotations::TESTS_PASSED, "42")
            .with_annotation(annotations::TESTS_TOTAL, "many");
        assert_eq!(manifest.u64_annotation(annotations::TESTS_PASSED), Some(42));
        assert_eq!(manifest.u64_annotation(annotations::TESTS_TOTAL), None);
    }
}
