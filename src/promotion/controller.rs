//! The promotion pipeline.
//!
//! ```text
//! VALIDATE_TRANSITION → RESOLVE_SOURCE → RUN_GATES → VERIFY_SIGNATURE
//!   → CHECK_AUTHORIZATION → CREATE_TAG → MOVE_LATEST → CACHE
//!   → SYNC_SECONDARIES → PERSIST_RECORD
//! ```
//!
//! Nothing is written before CREATE_TAG. Once the environment tag exists,
//! a failure in a later fatal stage deletes it again and restores
//! `latest-<env>` before the error is returned.

use std::sync::Arc;

use chrono::Utc;
use oci_promote_cache::CacheStore;
use oci_promote_resilience::{BreakerSnapshot, CircuitBreakerRegistry, ResilienceError, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};

use super::impact::analyze_impact;
use super::record::{
    generate_id, generate_trace_id, PromotionRecord, RegistrySyncStatus, RollbackImpact, RollbackRecord,
};
use super::store::RecordStore;
use super::{env_tag, latest_tag};
use crate::auth::{AuthorizationChecker, AuthorizationResult, Operator};
use crate::config::{EnvironmentConfig, PromotionConfig};
use crate::error::{PromotionError, PromotionResult};
use crate::gates::{run_gates, GateContext, GateRunner, StandardGateRunner};
use crate::registry::{registry_host, DatasetSummary, Manifest, RegistryClient, RegistryError, ResilientRegistry};
use crate::verify::{SignatureVerifier, VerificationStatus};

/// Promotions and rollbacks recorded for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentHistory {
    pub environment: String,
    pub promotions: Vec<PromotionRecord>,
    pub rollbacks: Vec<RollbackRecord>,
}

/// Outcome of moving `latest-<env>`.
enum LatestMove {
    Moved { previous: Option<String> },
    AlreadyCurrent,
}

fn is_not_found(error: &ResilienceError<RegistryError>) -> bool {
    matches!(
        error,
        ResilienceError::Operation {
            source: RegistryError::NotFound(_),
            ..
        }
    )
}

fn fail(registry: &ResilientRegistry) -> impl FnOnce(ResilienceError<RegistryError>) -> PromotionError + '_ {
    move |e| PromotionError::from_registry(registry.uri(), e)
}

/// Sequences gates, signature checks, authorization and tag writes for one
/// primary registry.
///
/// Safe to share between threads; every call is independent apart from the
/// per-registry circuit breakers.
pub struct PromotionController {
    config: PromotionConfig,
    primary: Arc<dyn RegistryClient>,
    records: Arc<dyn RecordStore>,
    verifier: Arc<dyn SignatureVerifier>,
    gates: Arc<dyn GateRunner>,
    auth: AuthorizationChecker,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
    cache: Option<CacheStore>,
}

impl PromotionController {
    pub fn new(
        config: PromotionConfig,
        primary: Arc<dyn RegistryClient>,
        records: Arc<dyn RecordStore>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        let auth = AuthorizationChecker::new(config.authorization.clone());
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let policy = RetryPolicy::new(config.retry.clone());
        Self {
            config,
            primary,
            records,
            verifier,
            gates: Arc::new(StandardGateRunner),
            auth,
            breakers,
            policy,
            cache: None,
        }
    }

    pub fn with_gate_runner(mut self, gates: Arc<dyn GateRunner>) -> Self {
        self.gates = gates;
        self
    }

    /// Store every promoted artifact in `cache`.
    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share breakers with other controllers in this process.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }

    fn guard(&self, client: Arc<dyn RegistryClient>) -> ResilientRegistry {
        let breaker = self.breakers.get(client.uri());
        ResilientRegistry::new(client, self.policy.clone(), breaker)
    }

    fn primary(&self) -> ResilientRegistry {
        self.guard(Arc::clone(&self.primary))
    }

    /// Promote `tag` from `from_env` to `to_env` on the primary registry.
    ///
    /// With `dry_run`, every stage up to tag creation runs and the returned
    /// record is marked `dry_run`; nothing is written or persisted.
    pub fn promote(
        &self,
        tag: &str,
        from_env: &str,
        to_env: &str,
        operator: &Operator,
        dry_run: bool,
    ) -> PromotionResult<PromotionRecord> {
        let trace_id = generate_trace_id();
        let span = info_span!("promote", trace_id = %trace_id, tag, from = from_env, to = to_env);
        let _guard = span.enter();
        self.execute(trace_id, tag, from_env, to_env, operator, dry_run, &[], false)
    }

    /// Promote on the primary, then replicate the environment tag to each
    /// secondary.
    ///
    /// Secondary failures never fail the call. Each becomes a
    /// `synced = false` status and a warning naming the registry host. With
    /// `verify_digests`, a secondary that stored a different digest is
    /// reported the same way.
    #[allow(clippy::too_many_arguments)]
    pub fn promote_multi(
        &self,
        tag: &str,
        from_env: &str,
        to_env: &str,
        operator: &Operator,
        secondaries: &[Arc<dyn RegistryClient>],
        verify_digests: bool,
        dry_run: bool,
    ) -> PromotionResult<PromotionRecord> {
        let trace_id = generate_trace_id();
        let span = info_span!(
            "promote_multi",
            trace_id = %trace_id,
            tag,
            from = from_env,
            to = to_env,
            secondaries = secondaries.len()
        );
        let _guard = span.enter();
        self.execute(trace_id, tag, from_env, to_env, operator, dry_run, secondaries, verify_digests)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        trace_id: String,
        tag: &str,
        from_env: &str,
        to_env: &str,
        operator: &Operator,
        dry_run: bool,
        secondaries: &[Arc<dyn RegistryClient>],
        verify_digests: bool,
    ) -> PromotionResult<PromotionRecord> {
        info!(operator = %operator.id, dry_run, "promotion started");
        let target = self.target_environment(from_env, to_env)?;
        let primary = self.primary();

        let (source_ref, digest) = self.resolve_source(&primary, tag, from_env)?;
        let manifest = primary.get_manifest(&digest).map_err(fail(&primary))?;
        let content = primary.fetch_blob(&digest).map_err(fail(&primary))?;
        debug!(source = %source_ref, digest = %digest, size = content.len(), "source resolved");

        let ctx = GateContext {
            tag,
            digest: &digest,
            from_env,
            to_env,
            manifest: &manifest,
        };
        let gate_results = run_gates(self.gates.as_ref(), &target.gates, &ctx);
        let failed: Vec<String> = gate_results
            .iter()
            .filter(|r| r.is_failed())
            .map(|r| r.gate.clone())
            .collect();
        if !failed.is_empty() {
            return Err(PromotionError::GateValidation {
                tag: tag.to_string(),
                environment: to_env.to_string(),
                failed,
                results: gate_results,
            });
        }

        let mut warnings = Vec::new();
        let verification = self.verifier.verify(&content, &manifest, &source_ref);
        match verification.status {
            VerificationStatus::Verified => {}
            VerificationStatus::Unsigned if !target.require_signature => {
                warn!(artifact = %source_ref, "promoting unsigned artifact");
                warnings.push(format!(
                    "{} is unsigned; signatures are not required for {}",
                    source_ref, to_env
                ));
            }
            _ => {
                return Err(PromotionError::SignatureVerification {
                    tag: tag.to_string(),
                    digest,
                    reason: verification
                        .failure_reason
                        .unwrap_or_else(|| "signature verification failed".to_string()),
                });
            }
        }

        let previous_operator = self.records.latest_promotion(tag, from_env)?.map(|r| r.operator);
        let authorization = self.authorize(operator, previous_operator.as_deref())?;

        let target_tag = env_tag(tag, to_env);
        let mut record = PromotionRecord {
            promotion_id: generate_id(),
            artifact_digest: digest.clone(),
            artifact_tag: tag.to_string(),
            source_environment: from_env.to_string(),
            target_environment: to_env.to_string(),
            gate_results,
            signature_verified: verification.is_verified(),
            signer_identity: verification.signer_identity,
            operator: operator.id.clone(),
            promoted_at: Utc::now(),
            dry_run,
            trace_id,
            authorization_passed: authorization.authorized,
            authorized_via: authorization.authorized_via,
            previous_digest: None,
            warnings,
            registry_sync_status: Vec::new(),
        };

        if dry_run {
            match primary.get_artifact_digest(&target_tag) {
                Ok(existing) => record.warnings.push(format!(
                    "{} already exists at {}; promotion would fail",
                    target_tag, existing
                )),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(PromotionError::from_registry(primary.uri(), e)),
            }
            info!(promotion_id = %record.promotion_id, "dry run complete");
            return Ok(record);
        }

        primary.create_tag(&target_tag, &digest).map_err(fail(&primary))?;
        info!(tag = %target_tag, digest = %digest, "environment tag created");

        let latest_previous = match self.advance_latest(&primary, to_env, &digest) {
            Ok(LatestMove::Moved { previous }) => Some(previous),
            Ok(LatestMove::AlreadyCurrent) => {
                record
                    .warnings
                    .push(format!("{} already pointed at {}", latest_tag(to_env), digest));
                None
            }
            Err(e) => {
                self.compensate(&primary, &target_tag, to_env, &digest, None);
                return Err(e);
            }
        };
        record.previous_digest = latest_previous.clone().flatten();

        if let Some(cache) = &self.cache {
            let manifest_json = serde_json::to_vec(&manifest).ok();
            if let Err(e) = cache.put(&digest, &target_tag, primary.uri(), &content, manifest_json.as_deref()) {
                warn!(error = %e, "failed to cache promoted artifact");
                record.warnings.push(format!("artifact not cached: {}", e));
            }
        }

        if !secondaries.is_empty() {
            let (statuses, sync_warnings) = self.sync_secondaries(secondaries, &target_tag, &digest, &manifest, &content, verify_digests);
            record.registry_sync_status = statuses;
            record.warnings.extend(sync_warnings);
        }

        if let Err(e) = self.records.save_promotion(&record) {
            error!(error = %e, "failed to persist promotion record, reverting tags");
            self.compensate(&primary, &target_tag, to_env, &digest, latest_previous.as_ref());
            return Err(e.into());
        }

        info!(
            promotion_id = %record.promotion_id,
            digest = %digest,
            warnings = record.warnings.len(),
            "promotion complete"
        );
        Ok(record)
    }

    fn known_environment(&self, name: &str) -> PromotionResult<&EnvironmentConfig> {
        self.config
            .environment(name)
            .ok_or_else(|| PromotionError::UnknownEnvironment(name.to_string()))
    }

    fn target_environment(&self, from_env: &str, to_env: &str) -> PromotionResult<&EnvironmentConfig> {
        self.known_environment(from_env)?;
        let target = self.known_environment(to_env)?;
        self.config
            .check_transition(from_env, to_env)
            .map_err(|reason| PromotionError::InvalidTransition {
                from: from_env.to_string(),
                to: to_env.to_string(),
                reason,
            })?;
        if target.locked {
            return Err(PromotionError::EnvironmentLocked {
                environment: to_env.to_string(),
                reason: target.lock_reason.clone(),
            });
        }
        Ok(target)
    }

    /// `<tag>-<from_env>`, or the bare tag when `from_env` starts the chain.
    fn resolve_source(
        &self,
        primary: &ResilientRegistry,
        tag: &str,
        from_env: &str,
    ) -> PromotionResult<(String, String)> {
        let source_tag = env_tag(tag, from_env);
        match primary.get_artifact_digest(&source_tag) {
            Ok(digest) => return Ok((source_tag, digest)),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(PromotionError::from_registry(primary.uri(), e)),
        }
        if self.config.is_first_environment(from_env) {
            match primary.get_artifact_digest(tag) {
                Ok(digest) => return Ok((tag.to_string(), digest)),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(PromotionError::from_registry(primary.uri(), e)),
            }
        }
        Err(PromotionError::VersionNotPromoted {
            tag: tag.to_string(),
            environment: from_env.to_string(),
            reason: format!("{} not found in {}", source_tag, primary.uri()),
        })
    }

    fn authorize(&self, operator: &Operator, previous_operator: Option<&str>) -> PromotionResult<AuthorizationResult> {
        let result = self.auth.check_authorization(&operator.id, &operator.groups);
        if !result.authorized {
            return Err(PromotionError::AuthorizationDenied {
                operator: operator.id.clone(),
                reason: result.reason.unwrap_or_else(|| "not authorized".to_string()),
            });
        }
        let sod = self.auth.check_separation_of_duties(&operator.id, previous_operator);
        if !sod.allowed {
            return Err(PromotionError::AuthorizationDenied {
                operator: operator.id.clone(),
                reason: sod.reason.unwrap_or_else(|| "separation of duties".to_string()),
            });
        }
        Ok(result)
    }

    /// Compare-and-swap `latest-<env>` to `digest`, retrying when another
    /// promotion moves it in between.
    fn advance_latest(&self, primary: &ResilientRegistry, env: &str, digest: &str) -> PromotionResult<LatestMove> {
        let latest = latest_tag(env);
        let mut last_conflict = None;
        for attempt in self.policy.attempts() {
            let current = match primary.get_artifact_digest(&latest) {
                Ok(current) => Some(current),
                Err(e) if is_not_found(&e) => None,
                Err(e) => return Err(PromotionError::from_registry(primary.uri(), e)),
            };
            if current.as_deref() == Some(digest) {
                return Ok(LatestMove::AlreadyCurrent);
            }
            match primary.update_tag(&latest, current.as_deref(), digest) {
                Ok(()) => return Ok(LatestMove::Moved { previous: current }),
                Err(e) => match PromotionError::from_registry(primary.uri(), e) {
                    conflict @ PromotionError::ConcurrentModification { .. } => {
                        debug!(tag = %latest, attempt = attempt.number, "latest tag moved concurrently");
                        last_conflict = Some(conflict);
                    }
                    other => return Err(other),
                },
            }
        }
        Err(last_conflict.unwrap_or(PromotionError::ConcurrentModification {
            tag: latest,
            expected: None,
            actual: None,
        }))
    }

    /// Best-effort undo of CREATE_TAG and MOVE_LATEST.
    ///
    /// `latest_previous` is `Some` only when `latest-<env>` was moved; the
    /// inner value is what it pointed at before.
    fn compensate(
        &self,
        primary: &ResilientRegistry,
        target_tag: &str,
        env: &str,
        digest: &str,
        latest_previous: Option<&Option<String>>,
    ) {
        if let Some(previous) = latest_previous {
            let latest = latest_tag(env);
            let restored = match previous {
                Some(previous) => primary.update_tag(&latest, Some(digest), previous),
                None => primary.delete_tag(&latest).map(|_| ()),
            };
            if let Err(e) = restored {
                warn!(tag = %latest, error = %e, "failed to restore latest tag");
            }
        }
        match primary.delete_tag(target_tag) {
            Ok(_) => info!(tag = target_tag, "environment tag removed"),
            Err(e) => warn!(tag = target_tag, error = %e, "failed to remove environment tag"),
        }
    }

    /// Push the verified artifact to each secondary under `target_tag`.
    ///
    /// Only the secondary's own calls run under its breaker; the artifact was
    /// already read through the primary's.
    fn sync_secondaries(
        &self,
        secondaries: &[Arc<dyn RegistryClient>],
        target_tag: &str,
        digest: &str,
        manifest: &Manifest,
        content: &[u8],
        verify_digests: bool,
    ) -> (Vec<RegistrySyncStatus>, Vec<String>) {
        let mut statuses = Vec::with_capacity(secondaries.len());
        let mut warnings = Vec::new();

        for client in secondaries {
            let uri = client.uri().to_string();
            let host = registry_host(&uri).to_string();
            let secondary = self.guard(Arc::clone(client));

            let status = match secondary.put_artifact(target_tag, manifest, content) {
                Ok(synced) if verify_digests && synced != digest => {
                    let message = format!("digest mismatch: expected {}, registry stored {}", digest, synced);
                    warn!(registry = %host, %message, "secondary sync degraded");
                    warnings.push(format!("secondary registry {}: {}", host, message));
                    RegistrySyncStatus {
                        registry_uri: uri,
                        synced: false,
                        digest: Some(synced),
                        synced_at: Some(Utc::now()),
                        error: Some(message),
                    }
                }
                Ok(synced) => {
                    info!(registry = %host, "secondary synced");
                    RegistrySyncStatus {
                        registry_uri: uri,
                        synced: true,
                        digest: Some(synced),
                        synced_at: Some(Utc::now()),
                        error: None,
                    }
                }
                Err(e) => {
                    let message = PromotionError::from_registry(&uri, e).to_string();
                    warn!(registry = %host, error = %message, "secondary sync failed");
                    warnings.push(format!("secondary registry {} not synced: {}", host, message));
                    RegistrySyncStatus {
                        registry_uri: uri,
                        synced: false,
                        digest: None,
                        synced_at: None,
                        error: Some(message),
                    }
                }
            };
            statuses.push(status);
        }
        (statuses, warnings)
    }

    /// Revert `env` to the digest that was live before `tag` was promoted.
    ///
    /// `latest-<env>` is moved back with a compare-and-swap and
    /// `<tag>-<env>` is deleted, so `tag` can be promoted again later.
    pub fn rollback(&self, tag: &str, env: &str, reason: &str, operator: &Operator) -> PromotionResult<RollbackRecord> {
        let trace_id = generate_trace_id();
        let span = info_span!("rollback", trace_id = %trace_id, tag, env);
        let _guard = span.enter();
        info!(operator = %operator.id, %reason, "rollback started");

        let environment = self.known_environment(env)?;
        if environment.locked {
            return Err(PromotionError::EnvironmentLocked {
                environment: env.to_string(),
                reason: environment.lock_reason.clone(),
            });
        }

        let not_promoted = |reason: String| PromotionError::VersionNotPromoted {
            tag: tag.to_string(),
            environment: env.to_string(),
            reason,
        };
        let promotion = self
            .records
            .latest_promotion(tag, env)?
            .ok_or_else(|| not_promoted("no promotion record".to_string()))?;

        let primary = self.primary();
        let target_tag = env_tag(tag, env);
        let current = match primary.get_artifact_digest(&target_tag) {
            Ok(current) => current,
            Err(e) if is_not_found(&e) => return Err(not_promoted(format!("{} no longer exists", target_tag))),
            Err(e) => return Err(PromotionError::from_registry(primary.uri(), e)),
        };
        let previous = promotion
            .previous_digest
            .clone()
            .ok_or_else(|| not_promoted("no earlier version was live before it".to_string()))?;

        let authorization = self.authorize(operator, Some(promotion.operator.as_str()))?;

        let latest = latest_tag(env);
        primary.update_tag(&latest, Some(current.as_str()), &previous).map_err(fail(&primary))?;
        info!(tag = %latest, from = %current, to = %previous, "latest tag restored");

        if let Err(e) = primary.delete_tag(&target_tag) {
            if let Err(undo) = primary.update_tag(&latest, Some(previous.as_str()), &current) {
                warn!(tag = %latest, error = %undo, "failed to undo latest tag restore");
            }
            return Err(PromotionError::from_registry(primary.uri(), e));
        }

        let record = RollbackRecord {
            rollback_id: generate_id(),
            artifact_tag: tag.to_string(),
            environment: env.to_string(),
            previous_digest: current.clone(),
            restored_digest: previous.clone(),
            reason: reason.to_string(),
            operator: operator.id.clone(),
            rolled_back_at: Utc::now(),
            trace_id,
            authorization_passed: authorization.authorized,
            promotion_id: promotion.promotion_id,
            warnings: Vec::new(),
        };

        if let Err(e) = self.records.save_rollback(&record) {
            error!(error = %e, "failed to persist rollback record, reverting tags");
            if let Err(undo) = primary.create_tag(&target_tag, &current) {
                warn!(tag = %target_tag, error = %undo, "failed to recreate environment tag");
            }
            if let Err(undo) = primary.update_tag(&latest, Some(previous.as_str()), &current) {
                warn!(tag = %latest, error = %undo, "failed to undo latest tag restore");
            }
            return Err(e.into());
        }

        info!(rollback_id = %record.rollback_id, "rollback complete");
        Ok(record)
    }

    /// What rolling `tag` back in `env` would change. Never writes.
    pub fn analyze_rollback_impact(&self, tag: &str, env: &str) -> PromotionResult<RollbackImpact> {
        let span = info_span!("analyze_rollback_impact", tag, env);
        let _guard = span.enter();

        self.known_environment(env)?;
        let promotion = self
            .records
            .latest_promotion(tag, env)?
            .ok_or_else(|| PromotionError::VersionNotPromoted {
                tag: tag.to_string(),
                environment: env.to_string(),
                reason: "no promotion record".to_string(),
            })?;

        let primary = self.primary();
        let target_tag = env_tag(tag, env);
        let current = match primary.get_manifest(&target_tag) {
            Ok(manifest) => manifest,
            Err(e) if is_not_found(&e) => {
                return Err(PromotionError::VersionNotPromoted {
                    tag: tag.to_string(),
                    environment: env.to_string(),
                    reason: format!("{} no longer exists", target_tag),
                })
            }
            Err(e) => return Err(PromotionError::from_registry(primary.uri(), e)),
        };

        let previous: Option<Manifest> = match &promotion.previous_digest {
            Some(digest) => match primary.get_manifest(digest) {
                Ok(manifest) => Some(manifest),
                Err(e) if is_not_found(&e) => None,
                Err(e) => return Err(PromotionError::from_registry(primary.uri(), e)),
            },
            None => None,
        };

        Ok(analyze_impact(tag, env, &current, previous.as_ref()))
    }

    /// Recorded promotions and rollbacks for `env`, oldest first.
    pub fn history(&self, env: &str) -> PromotionResult<EnvironmentHistory> {
        self.known_environment(env)?;
        Ok(EnvironmentHistory {
            environment: env.to_string(),
            promotions: self.records.promotions_for_env(env)?,
            rollbacks: self.records.rollbacks_for_env(env)?,
        })
    }

    pub fn list_datasets(&self) -> PromotionResult<Vec<DatasetSummary>> {
        let primary = self.primary();
        primary.list_datasets().map_err(fail(&primary))
    }

    /// Upload an artifact to the primary under `tag`.
    pub fn push(&self, tag: &str, manifest: &Manifest, content: &[u8]) -> PromotionResult<String> {
        let primary = self.primary();
        let digest = primary
            .run(|client| client.put_artifact(tag, manifest, content))
            .map_err(fail(&primary))?;
        info!(tag, digest = %digest, registry = %primary.uri(), "artifact pushed");
        Ok(digest)
    }
}
