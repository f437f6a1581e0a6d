//! Rollback impact analysis.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex_lite::Regex;

use super::record::{Recommendation, RollbackImpact};
use crate::registry::{annotations, Manifest};

/// Major component of a `v?MAJOR.MINOR.PATCH...` version.
pub fn semver_major(version: &str) -> Option<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^v?(\d+)\.\d+\.\d+").expect("static regex"));
    re.captures(version.trim())?.get(1)?.as_str().parse().ok()
}

fn version_of(manifest: &Manifest, fallback_tag: Option<&str>) -> Option<String> {
    manifest
        .annotation(annotations::VERSION)
        .map(String::from)
        .or_else(|| fallback_tag.filter(|t| semver_major(t).is_some()).map(String::from))
}

/// Compare the live manifest with the one a rollback would restore.
pub fn analyze_impact(
    tag: &str,
    environment: &str,
    current: &Manifest,
    previous: Option<&Manifest>,
) -> RollbackImpact {
    let affected_products = current.list_annotation(annotations::CONSUMERS);
    let current_version = version_of(current, Some(tag));

    let Some(previous) = previous else {
        return RollbackImpact {
            artifact_tag: tag.to_string(),
            environment: environment.to_string(),
            current_digest: current.digest.clone(),
            previous_digest: None,
            current_version,
            previous_version: None,
            removed_fields: Vec::new(),
            major_version_change: false,
            breaking_change: false,
            affected_products,
            recommendation: Recommendation::NoPreviousVersion,
        };
    };

    let restored: BTreeSet<String> = previous.list_annotation(annotations::SCHEMA_FIELDS).into_iter().collect();
    let removed_fields: Vec<String> = current
        .list_annotation(annotations::SCHEMA_FIELDS)
        .into_iter()
        .filter(|f| !restored.contains(f))
        .collect();

    let previous_version = version_of(previous, None);
    let major_version_change = match (
        current_version.as_deref().and_then(semver_major),
        previous_version.as_deref().and_then(semver_major),
    ) {
        (Some(now), Some(then)) => now != then,
        _ => false,
    };

    let breaking_change = major_version_change || !removed_fields.is_empty();
    let recommendation = match (breaking_change, affected_products.is_empty()) {
        (true, false) => Recommendation::CoordinateWithConsumers,
        (true, true) => Recommendation::ProceedWithCaution,
        (false, _) => Recommendation::Proceed,
    };

    RollbackImpact {
        artifact_tag: tag.to_string(),
        environment: environment.to_string(),
        current_digest: current.digest.clone(),
        previous_digest: Some(previous.digest.clone()),
        current_version,
        previous_version,
        removed_fields,
        major_version_change,
        breaking_change,
        affected_products,
        recommendation,
    }
}
