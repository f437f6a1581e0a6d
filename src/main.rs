//! oci-promote CLI
//!
//! Entry point for the `oci-promote` command-line tool.

use clap::{Parser, Subcommand};
use oci_promote::auth::{get_operator_identity, groups_from_env, Operator, RegistryCredentials};
use oci_promote::config::{default_host_config_path, ConfigError, ConfigLoader, LoadedConfig, REPO_CONFIG_FILENAME};
use oci_promote::logging::init_logging;
use oci_promote::promotion::{FileRecordStore, PromotionRecord};
use oci_promote::registry::{annotations, open_registry, registry_host, RegistryClient, ResilientRegistry};
use oci_promote::verify::{
    compute_key_fingerprint, decode_signing_key, encode_signing_key, encode_verifying_key, generate_keypair,
    sign_manifest, Ed25519Verifier,
};
use oci_promote::{ExitCode, Manifest, PromotionConfig, PromotionController, PromotionError, PromotionResult};
use oci_promote_cache::CacheStore;
use oci_promote_resilience::{CircuitBreakerRegistry, RetryPolicy};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

/// Encoded signing key used by `push` when `--signing-key` is not given
const SIGNING_KEY_ENV: &str = "OCI_PROMOTE_SIGNING_KEY";

#[derive(Parser)]
#[command(name = "oci-promote")]
#[command(about = "Promote OCI artifacts through deployment environments", version)]
struct Cli {
    /// Path to config file (default: ./.oci-promote.toml if present)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Promote an artifact to the next environment
    Promote {
        /// Artifact tag, e.g. v1.2.0
        tag: String,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        /// Run every check without writing tags or records
        #[arg(long)]
        dry_run: bool,

        /// Operator identity (default: registry username, then OCI_PROMOTE_OPERATOR)
        #[arg(long)]
        operator: Option<String>,

        /// Operator group, repeatable (default: OCI_PROMOTE_GROUPS)
        #[arg(long = "group", value_delimiter = ',')]
        groups: Vec<String>,

        /// Secondary registry to replicate to, repeatable
        #[arg(long = "secondary")]
        secondaries: Vec<String>,

        /// Accept secondaries that stored a different digest
        #[arg(long)]
        no_verify_digests: bool,
    },

    /// Revert an environment to the version live before a promotion
    Rollback {
        tag: String,

        #[arg(long)]
        env: String,

        #[arg(long)]
        reason: String,

        #[arg(long)]
        operator: Option<String>,

        #[arg(long = "group", value_delimiter = ',')]
        groups: Vec<String>,
    },

    /// Show what a rollback would change without performing it
    Impact {
        tag: String,

        #[arg(long)]
        env: String,
    },

    /// Show promotion and rollback records for an environment
    History { env: String },

    /// List datasets in the primary registry
    Datasets,

    /// Local artifact cache commands
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Probe configured registries and show circuit breaker state
    Status {
        #[arg(long = "secondary")]
        secondaries: Vec<String>,
    },

    /// Upload an artifact to the primary registry
    Push {
        tag: String,

        /// File holding the artifact content
        file: PathBuf,

        /// File holding an encoded Ed25519 signing key (default: OCI_PROMOTE_SIGNING_KEY)
        #[arg(long)]
        signing_key: Option<PathBuf>,

        /// Signer identity recorded in the signature annotations
        #[arg(long)]
        signer: Option<String>,

        /// Dataset name annotation
        #[arg(long)]
        dataset: Option<String>,

        /// Semantic version annotation
        #[arg(long)]
        artifact_version: Option<String>,

        /// Extra annotation as key=value, repeatable
        #[arg(long = "annotation", value_parser = parse_annotation)]
        annotations: Vec<(String, String)>,

        /// Push without signing even if a key is available
        #[arg(long)]
        unsigned: bool,
    },

    /// Generate an Ed25519 signing keypair
    Keygen {
        /// Write <name>.key and <name>.pub instead of printing the private key
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Show the effective configuration and where it came from
    Config,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache statistics
    Stats,
    /// Remove expired entries
    Cleanup,
    /// Remove every entry
    Clear,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Invalid log level '{}': {}", cli.log_level, e);
        process::exit(ExitCode::Usage.as_i32());
    }

    let json = cli.json;
    let result = match cli.command {
        Commands::Keygen { out } => run_keygen(out.as_deref(), json),
        command => {
            let loaded = match load_config(cli.config) {
                Ok(loaded) => loaded,
                Err(e) => fail(PromotionError::from(e), json),
            };
            run_command(command, loaded, json)
        }
    };

    if let Err(e) = result {
        fail(e, json);
    }
}

fn run_command(command: Commands, loaded: LoadedConfig, json: bool) -> PromotionResult<()> {
    let config = loaded.config;
    match command {
        Commands::Promote {
            tag,
            from,
            to,
            dry_run,
            operator,
            groups,
            secondaries,
            no_verify_digests,
        } => {
            let operator = resolve_operator(operator, groups, json);
            let controller = build_controller(&config)?;
            let uris = secondary_uris(&config, secondaries);
            let record = if uris.is_empty() {
                controller.promote(&tag, &from, &to, &operator, dry_run)?
            } else {
                let clients = open_all(&uris, &config)?;
                controller.promote_multi(&tag, &from, &to, &operator, &clients, !no_verify_digests, dry_run)?
            };
            emit(&record, json, || print_promotion(&record));
        }
        Commands::Rollback {
            tag,
            env,
            reason,
            operator,
            groups,
        } => {
            let operator = resolve_operator(operator, groups, json);
            let controller = build_controller(&config)?;
            let record = controller.rollback(&tag, &env, &reason, &operator)?;
            emit(&record, json, || {
                println!("Rolled back {} in {}", record.artifact_tag, record.environment);
                println!("  latest-{}: {} -> {}", record.environment, record.previous_digest, record.restored_digest);
                println!("  Rollback ID: {}", record.rollback_id);
                println!("  Trace ID: {}", record.trace_id);
            });
        }
        Commands::Impact { tag, env } => {
            let controller = build_controller(&config)?;
            let impact = controller.analyze_rollback_impact(&tag, &env)?;
            emit(&impact, json, || {
                println!("Rollback impact for {} in {}", impact.artifact_tag, impact.environment);
                println!("  Current: {} ({})", impact.current_digest, impact.current_version.as_deref().unwrap_or("-"));
                match &impact.previous_digest {
                    Some(previous) => println!(
                        "  Previous: {} ({})",
                        previous,
                        impact.previous_version.as_deref().unwrap_or("-")
                    ),
                    None => println!("  Previous: none"),
                }
                if !impact.removed_fields.is_empty() {
                    println!("  Fields lost: {}", impact.removed_fields.join(", "));
                }
                println!("  Major version change: {}", impact.major_version_change);
                println!("  Breaking: {}", impact.breaking_change);
                if !impact.affected_products.is_empty() {
                    println!("  Consumers: {}", impact.affected_products.join(", "));
                }
                println!("  Recommendation: {:?}", impact.recommendation);
            });
        }
        Commands::History { env } => {
            let controller = build_controller(&config)?;
            let history = controller.history(&env)?;
            emit(&history, json, || {
                if history.promotions.is_empty() && history.rollbacks.is_empty() {
                    println!("No records for {}.", history.environment);
                    return;
                }
                println!("Promotions into {} ({} total):\n", history.environment, history.promotions.len());
                for p in &history.promotions {
                    println!(
                        "  {}  {}  {} by {}",
                        p.promoted_at.to_rfc3339(),
                        p.artifact_tag,
                        p.artifact_digest,
                        p.operator
                    );
                }
                if !history.rollbacks.is_empty() {
                    println!("\nRollbacks ({} total):\n", history.rollbacks.len());
                    for r in &history.rollbacks {
                        println!(
                            "  {}  {}  {} -> {} by {}: {}",
                            r.rolled_back_at.to_rfc3339(),
                            r.artifact_tag,
                            r.previous_digest,
                            r.restored_digest,
                            r.operator,
                            r.reason
                        );
                    }
                }
            });
        }
        Commands::Datasets => {
            let controller = build_controller(&config)?;
            let datasets = controller.list_datasets()?;
            emit(&datasets, json, || {
                if datasets.is_empty() {
                    println!("No datasets in {}.", config.registry);
                    return;
                }
                for d in &datasets {
                    println!("  {}  {}  {} ({} bytes)", d.name, d.tag, d.digest, d.size);
                }
            });
        }
        Commands::Cache { action } => run_cache(action, &config, json)?,
        Commands::Status { secondaries } => run_status(&config, secondaries, json)?,
        Commands::Push {
            tag,
            file,
            signing_key,
            signer,
            dataset,
            artifact_version,
            annotations: extra,
            unsigned,
        } => {
            let content = fs::read(&file)
                .map_err(|e| ConfigError::IoError(format!("failed to read {}: {}", file.display(), e)))?;
            let mut manifest = Manifest::for_content(&content);
            if let Some(dataset) = dataset {
                manifest = manifest.with_annotation(annotations::DATASET, dataset);
            }
            if let Some(version) = artifact_version {
                manifest = manifest.with_annotation(annotations::VERSION, version);
            }
            for (key, value) in extra {
                manifest = manifest.with_annotation(key, value);
            }
            if !unsigned {
                if let Some(encoded) = load_signing_key(signing_key.as_deref())? {
                    let key = decode_signing_key(&encoded)
                        .map_err(|e| ConfigError::ValidationError(format!("invalid signing key: {}", e)))?;
                    let signer = signer
                        .or_else(|| get_operator_identity(Some(&RegistryCredentials::from_env())))
                        .unwrap_or_else(|| compute_key_fingerprint(&key.verifying_key()));
                    manifest = sign_manifest(manifest, &key, &signer);
                }
            }

            let controller = build_controller(&config)?;
            let digest = controller.push(&tag, &manifest, &content)?;
            let output = serde_json::json!({
                "tag": tag,
                "digest": digest,
                "size": manifest.size,
                "signed": manifest.annotation(annotations::SIGNATURE).is_some(),
            });
            emit(&output, json, || {
                println!("Pushed {} -> {}", tag, digest);
                if manifest.annotation(annotations::SIGNATURE).is_none() {
                    println!("  (unsigned)");
                }
            });
        }
        Commands::Config => {
            let output = serde_json::json!({
                "config": config,
                "sources": loaded.sources,
            });
            emit(&output, json, || {
                println!("Registry: {}", config.registry);
                println!("Records: {}", config.records_dir.display());
                let chain: Vec<&str> = config.environments.iter().map(|e| e.name.as_str()).collect();
                println!("Environments: {}", chain.join(" -> "));
                for env in &config.environments {
                    let mut notes = Vec::new();
                    if env.locked {
                        notes.push("locked".to_string());
                    }
                    if !env.require_signature {
                        notes.push("unsigned allowed".to_string());
                    }
                    if !env.gates.is_empty() {
                        notes.push(format!("{} gate(s)", env.gates.len()));
                    }
                    if !notes.is_empty() {
                        println!("  {}: {}", env.name, notes.join(", "));
                    }
                }
                if !config.secondary_registries.is_empty() {
                    println!("Secondaries: {}", config.secondary_registries.join(", "));
                }
                println!("Trusted keys: {}", config.signing.trusted_keys.len());
                println!("\nSources:");
                for source in &loaded.sources {
                    println!("  {:?} {}", source.origin, source.path.as_deref().unwrap_or(""));
                }
            });
        }
        Commands::Keygen { out } => run_keygen(out.as_deref(), json)?,
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<LoadedConfig, ConfigError> {
    let loader = ConfigLoader::new().host(default_host_config_path());
    let loader = match path {
        Some(path) => loader.repo(path, true),
        None => loader.repo(REPO_CONFIG_FILENAME, false),
    };
    loader.load()
}

fn build_controller(config: &PromotionConfig) -> PromotionResult<PromotionController> {
    let primary = open(&config.registry, config)?;
    let records = Arc::new(FileRecordStore::open(&config.records_dir)?);
    let verifier = Ed25519Verifier::from_trusted(&config.signing.trusted_keys)
        .map_err(|e| ConfigError::ValidationError(format!("signing.trusted_keys: {}", e)))?;

    let controller = PromotionController::new(config.clone(), primary, records, Arc::new(verifier));
    if config.cache.enabled {
        let cache = CacheStore::new(config.cache.to_cache_config())?;
        return Ok(controller.with_cache(cache));
    }
    Ok(controller)
}

fn open(uri: &str, config: &PromotionConfig) -> PromotionResult<Arc<dyn RegistryClient>> {
    open_registry(uri, config.registry_timeout()).map_err(|source| PromotionError::Registry {
        registry: uri.to_string(),
        source,
    })
}

fn open_all(uris: &[String], config: &PromotionConfig) -> PromotionResult<Vec<Arc<dyn RegistryClient>>> {
    uris.iter().map(|uri| open(uri, config)).collect()
}

fn secondary_uris(config: &PromotionConfig, extra: Vec<String>) -> Vec<String> {
    let mut uris = config.secondary_registries.clone();
    for uri in extra {
        if !uris.contains(&uri) {
            uris.push(uri);
        }
    }
    uris
}

/// `--operator`, then registry credentials, then `OCI_PROMOTE_OPERATOR`.
fn resolve_operator(flag: Option<String>, groups: Vec<String>, json: bool) -> Operator {
    let id = flag
        .filter(|id| !id.trim().is_empty())
        .or_else(|| get_operator_identity(Some(&RegistryCredentials::from_env())));
    let Some(id) = id else {
        usage_error(
            "operator identity unknown: pass --operator or set OCI_PROMOTE_OPERATOR",
            json,
        );
    };
    let groups = if groups.is_empty() { groups_from_env() } else { groups };
    Operator::new(id).with_groups(groups)
}

fn load_signing_key(path: Option<&Path>) -> PromotionResult<Option<String>> {
    if let Some(path) = path {
        let encoded = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("failed to read {}: {}", path.display(), e)))?;
        return Ok(Some(encoded));
    }
    Ok(std::env::var(SIGNING_KEY_ENV).ok().filter(|v| !v.trim().is_empty()))
}

fn parse_annotation(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

fn run_cache(action: CacheCommands, config: &PromotionConfig, json: bool) -> PromotionResult<()> {
    let cache = CacheStore::new(config.cache.to_cache_config())?;
    match action {
        CacheCommands::Stats => {
            let stats = cache.stats()?;
            emit(&stats, json, || {
                println!("Cache: {}", stats.cache_dir.display());
                println!("  Entries: {} ({} immutable, {} mutable)", stats.entries, stats.immutable, stats.mutable);
                println!(
                    "  Size: {} / {} bytes ({:.1}%)",
                    stats.total_size, stats.max_size, stats.utilization_percent
                );
                println!("  Expired: {}", stats.expired);
                println!("  On disk: {} bytes", stats.disk_bytes);
            });
        }
        CacheCommands::Cleanup => {
            let removed = cache.cleanup_expired()?;
            emit(&serde_json::json!({ "removed": removed }), json, || {
                println!("Removed {} expired entries.", removed);
            });
        }
        CacheCommands::Clear => {
            let removed = cache.clear()?;
            emit(&serde_json::json!({ "removed": removed }), json, || {
                println!("Removed {} entries.", removed);
            });
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct RegistryStatus {
    registry: String,
    reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    datasets: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn run_status(config: &PromotionConfig, extra: Vec<String>, json: bool) -> PromotionResult<()> {
    let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
    let policy = RetryPolicy::new(config.retry.clone());

    let mut uris = vec![config.registry.clone()];
    uris.extend(secondary_uris(config, extra));

    let mut registries = Vec::with_capacity(uris.len());
    for uri in &uris {
        let status = match open(uri, config) {
            Ok(client) => {
                let guarded = ResilientRegistry::new(client, policy.clone(), breakers.get(uri));
                match guarded.list_datasets() {
                    Ok(datasets) => RegistryStatus {
                        registry: uri.clone(),
                        reachable: true,
                        datasets: Some(datasets.len()),
                        error: None,
                    },
                    Err(e) => RegistryStatus {
                        registry: uri.clone(),
                        reachable: false,
                        datasets: None,
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => RegistryStatus {
                registry: uri.clone(),
                reachable: false,
                datasets: None,
                error: Some(e.to_string()),
            },
        };
        registries.push(status);
    }

    let snapshots = breakers.snapshot();
    let output = serde_json::json!({ "registries": registries, "breakers": snapshots });
    emit(&output, json, || {
        for status in &registries {
            let host = registry_host(&status.registry);
            match (&status.datasets, &status.error) {
                (Some(count), _) => println!("  {}: reachable, {} dataset(s)", host, count),
                (None, Some(error)) => println!("  {}: unreachable ({})", host, error),
                (None, None) => println!("  {}: unreachable", host),
            }
        }
        println!();
        for snapshot in &snapshots {
            println!(
                "  breaker {}: {} ({}/{} failures)",
                snapshot.name, snapshot.state, snapshot.failure_count, snapshot.failure_threshold
            );
        }
    });

    if registries.iter().any(|r| !r.reachable) {
        process::exit(ExitCode::RegistryUnavailable.as_i32());
    }
    Ok(())
}

fn run_keygen(out: Option<&Path>, json: bool) -> PromotionResult<()> {
    let key = generate_keypair();
    let public_key = encode_verifying_key(&key.verifying_key());
    let fingerprint = compute_key_fingerprint(&key.verifying_key());
    let private_key = encode_signing_key(&key);

    if let Some(out) = out {
        let key_path = out.with_extension("key");
        let pub_path = out.with_extension("pub");
        write_secret(&key_path, &private_key)?;
        fs::write(&pub_path, format!("{}\n", public_key))
            .map_err(|e| ConfigError::IoError(format!("failed to write {}: {}", pub_path.display(), e)))?;
        let output = serde_json::json!({
            "public_key": public_key,
            "fingerprint": fingerprint,
            "private_key_path": key_path,
            "public_key_path": pub_path,
        });
        emit(&output, json, || {
            println!("Wrote {} and {}", key_path.display(), pub_path.display());
            print_trusted_key(&public_key, &fingerprint);
        });
        return Ok(());
    }

    let output = serde_json::json!({
        "public_key": public_key,
        "fingerprint": fingerprint,
        "private_key": private_key,
    });
    emit(&output, json, || {
        println!("Private key (keep secret, set as {}):\n  {}\n", SIGNING_KEY_ENV, private_key);
        print_trusted_key(&public_key, &fingerprint);
    });
    Ok(())
}

fn write_secret(path: &Path, contents: &str) -> PromotionResult<()> {
    let io_err = |e: std::io::Error| ConfigError::IoError(format!("failed to write {}: {}", path.display(), e));
    fs::write(path, format!("{}\n", contents)).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }
    Ok(())
}

fn print_trusted_key(public_key: &str, fingerprint: &str) {
    println!("Add to config:\n");
    println!("[[signing.trusted_keys]]");
    println!("public_key = \"{}\"", public_key);
    println!("fingerprint = \"{}\"", fingerprint);
}

fn print_promotion(record: &PromotionRecord) {
    let verb = if record.dry_run { "Would promote" } else { "Promoted" };
    println!(
        "{} {} from {} to {}",
        verb, record.artifact_tag, record.source_environment, record.target_environment
    );
    println!("  Digest: {}", record.artifact_digest);
    println!("  Signature verified: {}", record.signature_verified);
    if let Some(ref signer) = record.signer_identity {
        println!("  Signer: {}", signer);
    }
    println!("  Operator: {}", record.operator);
    if let Some(ref via) = record.authorized_via {
        println!("  Authorized via: {}", via);
    }
    for gate in &record.gate_results {
        println!("  Gate {}: {:?} ({} ms)", gate.gate, gate.status, gate.duration_ms);
    }
    for status in &record.registry_sync_status {
        let state = if status.synced { "synced" } else { "NOT synced" };
        println!("  Secondary {}: {}", registry_host(&status.registry_uri), state);
    }
    for warning in &record.warnings {
        println!("  Warning: {}", warning);
    }
    if !record.dry_run {
        println!("  Promotion ID: {}", record.promotion_id);
    }
    println!("  Trace ID: {}", record.trace_id);
}

fn emit<T: Serialize>(value: &T, json: bool, human: impl FnOnce()) {
    if !json {
        human();
        return;
    }
    match serde_json::to_string_pretty(value) {
        Ok(out) => println!("{}", out),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(ExitCode::General.as_i32());
        }
    }
}

fn fail(error: PromotionError, json: bool) -> ! {
    if json {
        println!("{}", error.to_json());
    } else {
        eprintln!("Error: {}", error);
    }
    process::exit(error.exit_code().as_i32());
}

fn usage_error(message: &str, json: bool) -> ! {
    if json {
        println!("{}", serde_json::json!({ "error": message, "kind": "usage", "exit_code": ExitCode::Usage.as_i32() }));
    } else {
        eprintln!("Error: {}", message);
    }
    process::exit(ExitCode::Usage.as_i32());
}
