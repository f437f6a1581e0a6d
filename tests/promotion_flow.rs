//! End-to-end promotion through a file-backed registry and record store.
//!
//! Covers the full dev -> staging -> prod chain, rollback, impact analysis,
//! the local cache, and configuration loaded from TOML.

use std::fs;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use oci_promote::config::{ConfigLoader, PromotionConfig};
use oci_promote::promotion::{FileRecordStore, PromotionController, Recommendation, RecordStore};
use oci_promote::registry::{annotations, LocalRegistry, Manifest, RegistryClient};
use oci_promote::verify::{encode_verifying_key, generate_keypair, sign_manifest, Ed25519Verifier, TrustedKey};
use oci_promote::{ExitCode, Operator, PromotionError};
use oci_promote_cache::{CacheConfig, CacheStore};
use oci_promote_resilience::RetryConfig;
use tempfile::TempDir;

struct Env {
    _dir: TempDir,
    registry: Arc<LocalRegistry>,
    records: Arc<FileRecordStore>,
    cache: CacheStore,
    key: SigningKey,
    config: PromotionConfig,
}

fn setup() -> Env {
    let dir = TempDir::new().unwrap();
    let registry_dir = dir.path().join("registry");
    let uri = format!("file://{}", registry_dir.display());
    let registry = Arc::new(LocalRegistry::open(&uri, &registry_dir).unwrap());
    let records = Arc::new(FileRecordStore::open(dir.path().join("records")).unwrap());
    let cache = CacheStore::new(CacheConfig::at(dir.path().join("cache"))).unwrap();

    let mut config = PromotionConfig::with_environments(&uri, dir.path().join("records"), ["dev", "staging", "prod"]);
    config.retry = RetryConfig {
        initial_delay_ms: 1,
        jitter: false,
        ..RetryConfig::default()
    };

    Env {
        _dir: dir,
        registry,
        records,
        cache,
        key: generate_keypair(),
        config,
    }
}

impl Env {
    fn controller(&self) -> PromotionController {
        let verifier = Ed25519Verifier::from_trusted(&[TrustedKey {
            public_key: encode_verifying_key(&self.key.verifying_key()),
            fingerprint: None,
        }])
        .unwrap();
        PromotionController::new(
            self.config.clone(),
            self.registry.clone(),
            self.records.clone(),
            Arc::new(verifier),
        )
        .with_cache(self.cache.clone())
    }

    fn push(&self, tag: &str, content: &[u8], fields: &str) -> String {
        let manifest = Manifest::for_content(content)
            .with_annotation(annotations::DATASET, "orders")
            .with_annotation(annotations::SCHEMA_FIELDS, fields);
        let manifest = sign_manifest(manifest, &self.key, "ci@example.com");
        self.controller().push(tag, &manifest, content).unwrap()
    }
}

#[test]
fn test_full_chain_and_rollback() {
    let env = setup();
    let controller = env.controller();
    let v1 = env.push("v1.0.0", b"orders,v1", "id,amount");
    let v2 = env.push("v1.1.0", b"orders,v1.1", "id,amount,currency");

    let alice = Operator::new("alice");
    let bob = Operator::new("bob");
    for tag in ["v1.0.0", "v1.1.0"] {
        controller.promote(tag, "dev", "staging", &alice, false).unwrap();
        controller.promote(tag, "staging", "prod", &bob, false).unwrap();
    }

    assert_eq!(env.registry.get_artifact_digest("latest-prod").unwrap(), v2);
    assert_eq!(env.registry.get_artifact_digest("v1.0.0-prod").unwrap(), v1);

    let impact = controller.analyze_rollback_impact("v1.1.0", "prod").unwrap();
    assert_eq!(impact.previous_digest.as_deref(), Some(v1.as_str()));
    assert_eq!(impact.removed_fields, vec!["currency".to_string()]);
    assert!(!impact.major_version_change);
    assert_eq!(impact.recommendation, Recommendation::ProceedWithCaution);

    let rollback = controller.rollback("v1.1.0", "prod", "currency column broke billing", &alice).unwrap();
    assert_eq!(rollback.restored_digest, v1);
    assert_eq!(env.registry.get_artifact_digest("latest-prod").unwrap(), v1);
    assert!(env.registry.get_artifact_digest("v1.1.0-prod").unwrap_err().is_not_found());

    // the rolled-back version can be promoted again once fixed
    controller.promote("v1.1.0", "staging", "prod", &bob, false).unwrap();
    assert_eq!(env.registry.get_artifact_digest("latest-prod").unwrap(), v2);
}

#[test]
fn test_records_survive_reopen() {
    let env = setup();
    env.push("v1.0.0", b"orders,v1", "id");
    let record = env
        .controller()
        .promote("v1.0.0", "dev", "staging", &Operator::new("alice"), false)
        .unwrap();

    let reopened = FileRecordStore::open(env.records.root()).unwrap();
    let found = reopened.latest_promotion("v1.0.0", "staging").unwrap().unwrap();
    assert_eq!(found, record);

    let path = env.records.root().join("promotions").join(format!("{}.json", record.promotion_id));
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["target_environment"], "staging");
    assert_eq!(json["operator"], "alice");
}

#[test]
fn test_promoted_artifact_is_cached() {
    let env = setup();
    let digest = env.push("v1.0.0", b"orders,v1", "id");
    env.controller()
        .promote("v1.0.0", "dev", "staging", &Operator::new("alice"), false)
        .unwrap();

    let entry = env.cache.get(&env.config.registry, "v1.0.0-staging").unwrap().unwrap();
    assert_eq!(entry.digest, digest);
    let stats = env.cache.stats().unwrap();
    assert_eq!(stats.entries, 1);
}

#[test]
fn test_datasets_listing() {
    let env = setup();
    env.push("v1.0.0", b"orders,v1", "id");
    let datasets = env.controller().list_datasets().unwrap();
    assert_eq!(datasets.len(), 1);
    assert_eq!(datasets[0].name, "orders");
}

#[test]
fn test_signature_from_untrusted_key() {
    let env = setup();
    let content = b"orders,v1";
    let manifest = sign_manifest(Manifest::for_content(content), &generate_keypair(), "mallory");
    env.registry.put_artifact("v1.0.0", &manifest, content).unwrap();

    let err = env
        .controller()
        .promote("v1.0.0", "dev", "staging", &Operator::new("alice"), false)
        .unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::SignatureVerification);
    let json = err.to_json();
    assert_eq!(json["kind"], "signature_verification");
    assert_eq!(json["exit_code"], 6);
}

#[test]
fn test_controller_from_toml_config() {
    let env = setup();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("promote.toml");
    fs::write(
        &path,
        format!(
            r#"
registry = "{registry}"
records_dir = "{records}"

[[environments]]
name = "dev"

[[environments]]
name = "staging"
locked = true
lock_reason = "quarter close"

[retry]
initial_delay_ms = 1
jitter = false
"#,
            registry = env.config.registry,
            records = env.records.root().display(),
        ),
    )
    .unwrap();

    let loaded = ConfigLoader::new().repo(&path, true).load().unwrap();
    assert_eq!(loaded.config.environments.len(), 2);

    env.push("v1.0.0", b"orders,v1", "id");
    let controller = PromotionController::new(
        loaded.config,
        env.registry.clone(),
        env.records.clone(),
        Arc::new(Ed25519Verifier::new().with_key(env.key.verifying_key())),
    );
    match controller.promote("v1.0.0", "dev", "staging", &Operator::new("alice"), false) {
        Err(PromotionError::EnvironmentLocked { environment, reason }) => {
            assert_eq!(environment, "staging");
            assert_eq!(reason.as_deref(), Some("quarter close"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}
