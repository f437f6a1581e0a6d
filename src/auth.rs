//! Operator authorization and separation of duties.
//!
//! [`AuthorizationChecker`] is immutable after construction and safe to
//! share between threads. Results are value objects stamped with the time
//! of the check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Env var overriding the operator identity
pub const OPERATOR_ENV: &str = "OCI_PROMOTE_OPERATOR";
/// Env var holding a comma list of operator groups
pub const GROUPS_ENV: &str = "OCI_PROMOTE_GROUPS";
/// Env vars holding registry credentials
pub const REGISTRY_USERNAME_ENV: &str = "OCI_PROMOTE_REGISTRY_USERNAME";
pub const REGISTRY_PASSWORD_ENV: &str = "OCI_PROMOTE_REGISTRY_PASSWORD";

/// Who may promote.
///
/// Empty lists count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub allowed_groups: Option<Vec<String>>,
    pub allowed_operators: Option<Vec<String>>,
    /// Forbid the same operator on two consecutive hops
    pub separation_of_duties: bool,
}

impl AuthorizationConfig {
    fn groups(&self) -> &[String] {
        self.allowed_groups.as_deref().unwrap_or_default()
    }

    fn operators(&self) -> &[String] {
        self.allowed_operators.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResult {
    pub authorized: bool,
    pub operator: String,
    /// `no_config`, `no_restrictions`, `operator:<id>` or `group:<name>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_via: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub groups_checked: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl AuthorizationResult {
    fn allow(operator: &str, via: String, groups: &[String]) -> Self {
        Self {
            authorized: true,
            operator: operator.to_string(),
            authorized_via: Some(via),
            reason: None,
            groups_checked: groups.to_vec(),
            checked_at: Utc::now(),
        }
    }

    fn deny(operator: &str, reason: String, groups: &[String]) -> Self {
        Self {
            authorized: false,
            operator: operator.to_string(),
            authorized_via: None,
            reason: Some(reason),
            groups_checked: groups.to_vec(),
            checked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeparationOfDutiesResult {
    pub allowed: bool,
    pub operator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_operator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Evaluates [`AuthorizationConfig`] for one operator at a time.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationChecker {
    config: Option<AuthorizationConfig>,
}

impl AuthorizationChecker {
    pub fn new(config: Option<AuthorizationConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> Option<&AuthorizationConfig> {
        self.config.as_ref()
    }

    /// Allowed operators are checked before allowed groups; the first match
    /// wins.
    pub fn check_authorization(&self, operator: &str, groups: &[String]) -> AuthorizationResult {
        let Some(config) = &self.config else {
            return AuthorizationResult::allow(operator, "no_config".to_string(), groups);
        };
        let (allowed_operators, allowed_groups) = (config.operators(), config.groups());
        if allowed_operators.is_empty() && allowed_groups.is_empty() {
            return AuthorizationResult::allow(operator, "no_restrictions".to_string(), groups);
        }

        if allowed_operators.iter().any(|o| o == operator) {
            debug!(operator, "authorized by operator allow-list");
            return AuthorizationResult::allow(operator, format!("operator:{}", operator), groups);
        }
        if let Some(group) = groups.iter().find(|g| allowed_groups.contains(g)) {
            debug!(operator, group = %group, "authorized by group allow-list");
            return AuthorizationResult::allow(operator, format!("group:{}", group), groups);
        }

        let mut unmatched = Vec::new();
        if !allowed_operators.is_empty() {
            unmatched.push("allowed_operators");
        }
        if !allowed_groups.is_empty() {
            unmatched.push("allowed_groups");
        }
        let groups_desc = if groups.is_empty() {
            "no groups".to_string()
        } else {
            format!("groups [{}]", groups.join(", "))
        };
        let reason = format!(
            "operator '{}' with {} matches neither {}",
            operator,
            groups_desc,
            unmatched.join(" nor ")
        );
        info!(operator, %reason, "authorization denied");
        AuthorizationResult::deny(operator, reason, groups)
    }

    /// Identities compare case-insensitively.
    pub fn check_separation_of_duties(&self, operator: &str, previous_operator: Option<&str>) -> SeparationOfDutiesResult {
        let enabled = self.config.as_ref().is_some_and(|c| c.separation_of_duties);
        let violation = enabled && previous_operator.is_some_and(|prev| prev.to_lowercase() == operator.to_lowercase());
        SeparationOfDutiesResult {
            allowed: !violation,
            operator: operator.to_string(),
            previous_operator: previous_operator.map(String::from),
            reason: violation.then(|| {
                format!(
                    "separation of duties: operator '{}' performed the previous promotion of this artifact",
                    operator
                )
            }),
        }
    }
}

/// Credentials presented to the primary registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryCredentials {
    pub fn from_env() -> Self {
        Self {
            username: non_empty_env(REGISTRY_USERNAME_ENV),
            password: non_empty_env(REGISTRY_PASSWORD_ENV),
        }
    }
}

/// Registry-side facts about the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryMetadata {
    pub groups: Vec<String>,
}

/// A resolved operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Operator {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// Credentials username first, then `OCI_PROMOTE_OPERATOR`.
pub fn get_operator_identity(credentials: Option<&RegistryCredentials>) -> Option<String> {
    resolve_identity(credentials, non_empty_env(OPERATOR_ENV))
}

fn resolve_identity(credentials: Option<&RegistryCredentials>, env_override: Option<String>) -> Option<String> {
    credentials
        .and_then(|c| c.username.clone())
        .filter(|u| !u.trim().is_empty())
        .or(env_override)
}

/// Groups from registry metadata, empty when there is none.
pub fn get_operator_groups(metadata: Option<&RegistryMetadata>) -> Vec<String> {
    metadata.map(|m| m.groups.clone()).unwrap_or_default()
}

/// Groups from `OCI_PROMOTE_GROUPS`.
pub fn groups_from_env() -> Vec<String> {
    non_empty_env(GROUPS_ENV).map(|v| split_list(&v)).unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
