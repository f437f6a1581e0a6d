//! Concurrent promotions racing for the same tags.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use oci_promote::config::PromotionConfig;
use oci_promote::promotion::{MemoryRecordStore, PromotionController, RecordStore};
use oci_promote::registry::{
    DatasetSummary, LocalRegistry, Manifest, MemoryRegistry, RegistryClient, RegistryError, RegistryResult,
};
use oci_promote::verify::{generate_keypair, sign_manifest, Ed25519Verifier};
use oci_promote::{ExitCode, Operator, PromotionError};
use oci_promote_resilience::RetryConfig;
use tempfile::TempDir;

fn config(uri: &str) -> PromotionConfig {
    let mut config = PromotionConfig::with_environments(uri, "/unused", ["dev", "staging", "prod"]);
    // The latest-<env> compare-and-swap loop is bounded by max_attempts, and
    // every racing thread contends on it.
    config.retry = RetryConfig {
        max_attempts: 8,
        initial_delay_ms: 1,
        jitter: false,
        ..RetryConfig::default()
    };
    config
}

fn race(registry: Arc<dyn RegistryClient>, threads: usize) -> (Vec<Result<String, PromotionError>>, String) {
    let key = generate_keypair();
    let content = b"orders,v1";
    let manifest = sign_manifest(Manifest::for_content(content), &key, "ci");
    let digest = registry.put_artifact("v1.0.0", &manifest, content).unwrap();

    let records = Arc::new(MemoryRecordStore::new());
    let controller = Arc::new(PromotionController::new(
        config(registry.uri()),
        registry,
        records,
        Arc::new(Ed25519Verifier::new().with_key(key.verifying_key())),
    ));
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let controller = Arc::clone(&controller);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let operator = Operator::new(format!("operator-{}", i));
                barrier.wait();
                controller
                    .promote("v1.0.0", "dev", "staging", &operator, false)
                    .map(|r| r.promotion_id)
            })
        })
        .collect();

    let results = handles
        .into_iter()
        .map(|h| h.join().expect("Thread panicked"))
        .collect();
    (results, digest)
}

fn assert_single_winner(results: &[Result<String, PromotionError>], digest: &str) {
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one promotion must win: {:?}", results);

    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        match result {
            PromotionError::TagExists { tag, existing_digest } => {
                assert_eq!(tag, "v1.0.0-staging");
                assert_eq!(existing_digest, digest);
            }
            other => panic!("loser failed with {:?}", other),
        }
        assert_eq!(result.exit_code(), ExitCode::TagExists);
    }
}

#[test]
fn test_memory_registry_race_has_one_winner() {
    let registry = Arc::new(MemoryRegistry::new("memory://race.example.com"));
    let (results, digest) = race(registry.clone(), 8);
    assert_single_winner(&results, &digest);
    assert_eq!(registry.tags().get("latest-staging"), Some(&digest));
}

#[test]
fn test_local_registry_race_has_one_winner() {
    let dir = TempDir::new().unwrap();
    let uri = format!("file://{}", dir.path().display());
    let registry = Arc::new(LocalRegistry::open(&uri, dir.path()).unwrap());
    let (results, digest) = race(registry.clone(), 8);
    assert_single_winner(&results, &digest);
    assert_eq!(registry.get_artifact_digest("latest-staging").unwrap(), digest);
}

#[test]
fn test_distinct_versions_all_land() {
    let registry = Arc::new(MemoryRegistry::new("memory://parallel.example.com"));
    let key = generate_keypair();
    let mut digests = Vec::new();
    for i in 0..6 {
        let content = format!("orders,v1.{}", i);
        let manifest = sign_manifest(Manifest::for_content(content.as_bytes()), &key, "ci");
        digests.push(registry.put_artifact(&format!("v1.{}.0", i), &manifest, content.as_bytes()).unwrap());
    }

    let controller = Arc::new(PromotionController::new(
        config(registry.uri()),
        registry.clone(),
        Arc::new(MemoryRecordStore::new()),
        Arc::new(Ed25519Verifier::new().with_key(key.verifying_key())),
    ));
    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let controller = Arc::clone(&controller);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                controller.promote(&format!("v1.{}.0", i), "dev", "staging", &Operator::new("alice"), false)
            })
        })
        .collect();

    let records: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("Thread panicked").unwrap())
        .collect();

    let tags = registry.tags();
    for (i, digest) in digests.iter().enumerate() {
        assert_eq!(tags.get(&format!("v1.{}.0-staging", i)), Some(digest));
    }
    // latest-staging ends at one of the promoted digests, and every
    // recorded previous_digest is unique or absent
    assert!(digests.contains(tags.get("latest-staging").unwrap()));
    let previous: Vec<_> = records.iter().filter_map(|r| r.previous_digest.clone()).collect();
    let unique: std::collections::HashSet<_> = previous.iter().collect();
    assert_eq!(previous.len(), unique.len());
}

type Rival = Box<dyn FnOnce() + Send>;

/// Runs `rival` inside the first `create_tag`, then reports a timeout as if
/// the request never got an answer.
struct TimeoutAfterRival {
    inner: Arc<MemoryRegistry>,
    rival: Mutex<Option<Rival>>,
}

impl RegistryClient for TimeoutAfterRival {
    fn uri(&self) -> &str {
        self.inner.uri()
    }

    fn get_manifest(&self, reference: &str) -> RegistryResult<Manifest> {
        self.inner.get_manifest(reference)
    }

    fn get_artifact_digest(&self, reference: &str) -> RegistryResult<String> {
        self.inner.get_artifact_digest(reference)
    }

    fn fetch_blob(&self, reference: &str) -> RegistryResult<Vec<u8>> {
        self.inner.fetch_blob(reference)
    }

    fn create_tag(&self, tag: &str, digest: &str) -> RegistryResult<String> {
        let rival = self.rival.lock().unwrap().take();
        if let Some(rival) = rival {
            rival();
            return Err(RegistryError::Timeout(format!("create {} timed out", tag)));
        }
        self.inner.create_tag(tag, digest)
    }

    fn update_tag(&self, tag: &str, expected: Option<&str>, digest: &str) -> RegistryResult<()> {
        self.inner.update_tag(tag, expected, digest)
    }

    fn delete_tag(&self, tag: &str) -> RegistryResult<bool> {
        self.inner.delete_tag(tag)
    }

    fn put_artifact(&self, tag: &str, manifest: &Manifest, blob: &[u8]) -> RegistryResult<String> {
        self.inner.put_artifact(tag, manifest, blob)
    }

    fn list_datasets(&self) -> RegistryResult<Vec<DatasetSummary>> {
        self.inner.list_datasets()
    }
}

#[test]
fn test_retry_after_timeout_loses_to_rival() {
    let registry = Arc::new(MemoryRegistry::new("memory://timeout.example.com"));
    let key = generate_keypair();
    let content = b"orders,v1";
    let manifest = sign_manifest(Manifest::for_content(content), &key, "ci");
    let digest = registry.put_artifact("v1.0.0", &manifest, content).unwrap();
    let verifier = Arc::new(Ed25519Verifier::new().with_key(key.verifying_key()));

    let rival_records = Arc::new(MemoryRecordStore::new());
    let rival = PromotionController::new(
        config(registry.uri()),
        registry.clone(),
        rival_records.clone(),
        verifier.clone(),
    );
    let client = Arc::new(TimeoutAfterRival {
        inner: registry.clone(),
        rival: Mutex::new(Some(Box::new(move || {
            rival
                .promote("v1.0.0", "dev", "staging", &Operator::new("bob"), false)
                .unwrap();
        }))),
    });

    let records = Arc::new(MemoryRecordStore::new());
    let controller = PromotionController::new(config(registry.uri()), client, records.clone(), verifier);
    let err = controller
        .promote("v1.0.0", "dev", "staging", &Operator::new("alice"), false)
        .unwrap_err();

    match &err {
        PromotionError::TagExists { tag, existing_digest } => {
            assert_eq!(tag, "v1.0.0-staging");
            assert_eq!(existing_digest, &digest);
        }
        other => panic!("expected TagExists, got {:?}", other),
    }
    assert!(rival_records.latest_promotion("v1.0.0", "staging").unwrap().is_some());
    assert!(records.latest_promotion("v1.0.0", "staging").unwrap().is_none());
    assert_eq!(registry.tags().get("latest-staging"), Some(&digest));
}
