//! Promotion gates.
//!
//! Gates are configured per target environment as a closed set of kinds.
//! Every enabled gate runs, even after an earlier one failed, so a caller
//! sees all failures at once.

use std::process::Command;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::{annotations, Manifest};

/// Gate outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    Passed,
    Failed,
    Skipped,
}

/// Result of evaluating one gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub status: GateStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GateResult {
    pub fn is_failed(&self) -> bool {
        self.status == GateStatus::Failed
    }
}

/// What a gate checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateKind {
    /// Every named policy must be listed in the policies annotation.
    PolicyCompliance { policies: Vec<String> },
    /// passed/total test counts must reach `min_pass_rate` (0.0..=1.0).
    Tests { min_pass_rate: f64 },
    /// An external command; exit status 0 passes.
    Custom {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// A configured gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    #[serde(flatten)]
    pub kind: GateKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl GateSpec {
    pub fn new(kind: GateKind) -> Self {
        Self { kind, enabled: true }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            GateKind::PolicyCompliance { .. } => "policy_compliance",
            GateKind::Tests { .. } => "tests",
            GateKind::Custom { name, .. } => name,
        }
    }
}

/// Inputs available to a gate.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub tag: &'a str,
    pub digest: &'a str,
    pub from_env: &'a str,
    pub to_env: &'a str,
    pub manifest: &'a Manifest,
}

/// Evaluates a single gate. `Err` carries the failure message.
pub trait GateRunner: Send + Sync {
    fn evaluate(&self, gate: &GateSpec, ctx: &GateContext<'_>) -> Result<(), String>;
}

/// Runs every gate and times it. Disabled gates are reported as skipped.
pub fn run_gates(runner: &dyn GateRunner, gates: &[GateSpec], ctx: &GateContext<'_>) -> Vec<GateResult> {
    gates
        .iter()
        .map(|gate| {
            if !gate.enabled {
                return GateResult {
                    gate: gate.name().to_string(),
                    status: GateStatus::Skipped,
                    duration_ms: 0,
                    error: None,
                };
            }
            let started = Instant::now();
            let outcome = runner.evaluate(gate, ctx);
            let duration_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(()) => {
                    debug!(gate = gate.name(), duration_ms, "gate passed");
                    GateResult {
                        gate: gate.name().to_string(),
                        status: GateStatus::Passed,
                        duration_ms,
                        error: None,
                    }
                }
                Err(error) => {
                    warn!(gate = gate.name(), %error, "gate failed");
                    GateResult {
                        gate: gate.name().to_string(),
                        status: GateStatus::Failed,
                        duration_ms,
                        error: Some(error),
                    }
                }
            }
        })
        .collect()
}

/// Built-in evaluation of every [`GateKind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardGateRunner;

impl StandardGateRunner {
    fn policy_compliance(policies: &[String], manifest: &Manifest) -> Result<(), String> {
        let satisfied = manifest.list_annotation(annotations::POLICIES);
        let missing: Vec<&str> = policies
            .iter()
            .filter(|p| !satisfied.contains(p))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("policies not satisfied: {}", missing.join(", ")))
        }
    }

    fn tests(min_pass_rate: f64, manifest: &Manifest) -> Result<(), String> {
        let passed = manifest
            .u64_annotation(annotations::TESTS_PASSED)
            .ok_or_else(|| format!("missing annotation {}", annotations::TESTS_PASSED))?;
        let total = manifest
            .u64_annotation(annotations::TESTS_TOTAL)
            .ok_or_else(|| format!("missing annotation {}", annotations::TESTS_TOTAL))?;
        if total == 0 {
            return Err("no tests recorded".to_string());
        }
        let rate = passed as f64 / total as f64;
        if rate + f64::EPSILON < min_pass_rate {
            return Err(format!(
                "pass rate {:.1}% ({}/{}) below required {:.1}%",
                rate * 100.0,
                passed,
                total,
                min_pass_rate * 100.0
            ));
        }
        Ok(())
    }

    fn custom(command: &str, args: &[String], ctx: &GateContext<'_>) -> Result<(), String> {
        let output = Command::new(command)
            .args(args)
            .env("PROMOTE_TAG", ctx.tag)
            .env("PROMOTE_DIGEST", ctx.digest)
            .env("PROMOTE_FROM", ctx.from_env)
            .env("PROMOTE_TO", ctx.to_env)
            .output()
            .map_err(|e| format!("failed to run {}: {}", command, e))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        match (output.status.code(), detail.is_empty()) {
            (Some(code), true) => Err(format!("{} exited with status {}", command, code)),
            (Some(code), false) => Err(format!("{} exited with status {}: {}", command, code, detail)),
            (None, _) => Err(format!("{} terminated by signal", command)),
        }
    }
}

impl GateRunner for StandardGateRunner {
    fn evaluate(&self, gate: &GateSpec, ctx: &GateContext<'_>) -> Result<(), String> {
        match &gate.kind {
            GateKind::PolicyCompliance { policies } => Self::policy_compliance(policies, ctx.manifest),
            GateKind::Tests { min_pass_rate } => Self::tests(*min_pass_rate, ctx.manifest),
            GateKind::Custom { command, args, .. } => Self::custom(command, args, ctx),
        }
    }
}
