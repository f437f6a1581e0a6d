//! Loading and merging the configuration layers.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;
use super::{ConfigError, PromotionConfig};

/// Repo-level config file looked up in the working directory
pub const REPO_CONFIG_FILENAME: &str = ".oci-promote.toml";

/// Origin of a configuration source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Repo,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Typed configuration plus the sources that produced it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PromotionConfig,
    pub sources: Vec<ConfigSource>,
}

/// `~/.config/oci-promote/config.toml`, if HOME is set.
pub fn default_host_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/oci-promote/config.toml"))
}

/// Builder for the layered load.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    host: Option<PathBuf>,
    repo: Option<PathBuf>,
    repo_required: bool,
    cli: Option<Value>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// User-level file; skipped when missing.
    pub fn host(mut self, path: Option<PathBuf>) -> Self {
        self.host = path;
        self
    }

    /// Repo-level file. With `required`, a missing file is an error.
    pub fn repo(mut self, path: impl Into<PathBuf>, required: bool) -> Self {
        self.repo = Some(path.into());
        self.repo_required = required;
        self
    }

    /// Overrides from command-line flags.
    pub fn cli(mut self, overrides: Value) -> Self {
        self.cli = Some(overrides);
        self
    }

    pub fn load(self) -> Result<LoadedConfig, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if let Some(path) = self.host.as_deref().filter(|p| p.exists()) {
            let (value, digest) = load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Host,
                path: Some(path.display().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(path) = self.repo.as_deref() {
            if path.exists() {
                let (value, digest) = load_toml_file(path)?;
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::Repo,
                    path: Some(path.display().to_string()),
                    digest: Some(digest),
                });
            } else if self.repo_required {
                return Err(ConfigError::IoError(format!("config file {} not found", path.display())));
            }
        }

        if let Some(cli) = self.cli {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let config: PromotionConfig =
            serde_json::from_value(merged).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        debug!(sources = sources.len(), environments = config.environments.len(), "configuration loaded");
        Ok(LoadedConfig { config, sources })
    }
}

/// Load and parse a TOML file, returning the value and digest
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hex::encode(hasher.finalize());

    let contents = String::from_utf8(bytes)
        .map_err(|e| ConfigError::ParseError(format!("{}: invalid UTF-8: {}", path.display(), e)))?;
    let toml_value: toml::Value = toml::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

    Ok((toml_to_json(toml_value), digest))
}

fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(table.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect()),
    }
}
