//! Runner policy loading and defaults.
//!
//! The policy file is optional: every knob has a built-in default so a bare
//! `packrun run` works without one. Resolution order is `--policy`, then the
//! `RUNNER_POLICY_PATH` environment variable, then defaults.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

/// Environment variable overriding the default policy file location.
pub const RUNNER_POLICY_ENV: &str = "RUNNER_POLICY_PATH";

/// Current schema version for the runner policy file.
pub const POLICY_SCHEMA_VERSION: u32 = 1;

/// Strict-mode toggles for questions that produce no evidence blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidencePresenceGate {
    pub fail_on_empty_evidence: bool,
    pub fail_fast: bool,
}

impl Default for EvidencePresenceGate {
    fn default() -> Self {
        EvidencePresenceGate {
            fail_on_empty_evidence: true,
            fail_fast: true,
        }
    }
}

/// Quality requirements applied to advice responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdviceQualityGate {
    pub required_fields: Vec<String>,
    pub min_issues: usize,
    pub anti_praise_regex: Vec<String>,
    pub imperative_verb_regex: String,
}

impl Default for AdviceQualityGate {
    fn default() -> Self {
        AdviceQualityGate {
            required_fields: ["RATIONALE", "PATCH", "TEST", "CITATIONS"]
                .iter()
                .map(|field| field.to_string())
                .collect(),
            min_issues: 2,
            anti_praise_regex: vec![
                r"(?i)\blooks good\b".to_string(),
                r"(?i)\bno (issues|problems|concerns) found\b".to_string(),
                r"(?i)\bwell[- ](written|structured|designed)\b".to_string(),
                r"(?i)\bexcellent\b".to_string(),
                r"(?i)\bgreat job\b".to_string(),
            ],
            imperative_verb_regex: r"^(Add|Adjust|Avoid|Cap|Clarify|Document|Enforce|Extract|Fix|Guard|Handle|Harden|Introduce|Limit|Make|Move|Normalize|Prevent|Reject|Remove|Rename|Replace|Restrict|Return|Rework|Split|Tighten|Use|Validate|Verify)\b".to_string(),
        }
    }
}

/// Caps keeping validator issue lists readable in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueCaps {
    pub unknown_paths: usize,
    pub uncited_paths: usize,
    pub sources: usize,
    pub advice_top_k_cap: usize,
}

impl Default for IssueCaps {
    fn default() -> Self {
        IssueCaps {
            unknown_paths: 12,
            uncited_paths: 12,
            sources: 20,
            advice_top_k_cap: 40,
        }
    }
}

/// Bounded retry budget for failed advice validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdviceRetry {
    pub attempts: usize,
    pub on_validation_fail: AdviceRetryMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceRetryMode {
    Retry,
    Warn,
}

impl Default for AdviceRetry {
    fn default() -> Self {
        AdviceRetry {
            attempts: 2,
            on_validation_fail: AdviceRetryMode::Retry,
        }
    }
}

/// Global runner knobs, default filters, and artifact naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerPolicy {
    pub schema_version: u32,
    /// Pack-independent excludes applied before any pack filter.
    pub stale_path_denylist: Vec<String>,
    pub excludes: Vec<String>,
    pub includes: Vec<String>,
    pub test_path_patterns: Vec<String>,
    /// Pre-filter row count at or above which filtering to zero is diagnosed.
    pub starvation_threshold: usize,
    /// Promote `filtered_to_zero` diagnostics to fatal contract issues.
    pub elevate_starvation: bool,
    pub evidence_presence_gate: EvidencePresenceGate,
    pub advice_quality_gate: AdviceQualityGate,
    pub issue_caps: IssueCaps,
    pub advice_retry: AdviceRetry,
    pub default_max_items: usize,
    pub default_max_chars: usize,
    /// Optional wall-clock bound for each preflight subprocess.
    pub preflight_timeout_secs: Option<u64>,
    /// Catalog CLI used to read columns and the path universe from the table.
    pub catalog_cmd: Vec<String>,
    pub report_filename: String,
    pub manifest_filename: String,
    pub evidence_audit_summary_filename: String,
    /// Legacy artifact names remapped at resolution time.
    pub path_aliases: BTreeMap<String, String>,
    /// Extra instruction lines appended to the advice prompt template.
    pub advice_template_notes: Vec<String>,
}

impl Default for RunnerPolicy {
    fn default() -> Self {
        RunnerPolicy {
            schema_version: POLICY_SCHEMA_VERSION,
            stale_path_denylist: vec![
                "audit_runs/".to_string(),
                ".packrun/".to_string(),
                ".git/".to_string(),
            ],
            excludes: Vec::new(),
            includes: Vec::new(),
            test_path_patterns: vec![
                r"(^|/)tests?/".to_string(),
                r"_test\.[a-z]+$".to_string(),
                r"\.test\.[a-z]+$".to_string(),
                r"(^|/)test_[^/]+$".to_string(),
            ],
            starvation_threshold: 20,
            elevate_starvation: false,
            evidence_presence_gate: EvidencePresenceGate::default(),
            advice_quality_gate: AdviceQualityGate::default(),
            issue_caps: IssueCaps::default(),
            advice_retry: AdviceRetry::default(),
            default_max_items: 40,
            default_max_chars: 6000,
            preflight_timeout_secs: None,
            catalog_cmd: vec!["duckdb".to_string(), "-json".to_string(), "-c".to_string()],
            report_filename: "REPORT.md".to_string(),
            manifest_filename: "RUN_MANIFEST.json".to_string(),
            evidence_audit_summary_filename: "EVIDENCE_DELIVERY_SUMMARY.json".to_string(),
            path_aliases: BTreeMap::new(),
            advice_template_notes: Vec::new(),
        }
    }
}

impl RunnerPolicy {
    /// Apply `path_aliases` to a configured artifact filename.
    pub fn resolve_filename<'a>(&'a self, name: &'a str) -> &'a str {
        self.path_aliases.get(name).map_or(name, String::as_str)
    }
}

/// Load the policy from an explicit path, the env override, or defaults.
pub fn load_policy(explicit: Option<&Path>) -> Result<RunnerPolicy> {
    if let Some(path) = explicit {
        return load_policy_file(path);
    }
    if let Some(path) = env::var_os(RUNNER_POLICY_ENV) {
        return load_policy_file(Path::new(&path));
    }
    Ok(RunnerPolicy::default())
}

fn load_policy_file(path: &Path) -> Result<RunnerPolicy> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read runner policy {}", path.display()))?;
    let policy: RunnerPolicy =
        serde_yaml::from_str(&text).context("parse runner policy YAML")?;
    validate_policy(&policy)?;
    Ok(policy)
}

pub fn validate_policy(policy: &RunnerPolicy) -> Result<()> {
    if policy.schema_version != POLICY_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported runner policy schema_version {}",
            policy.schema_version
        ));
    }
    if policy.catalog_cmd.is_empty() {
        return Err(anyhow!("catalog_cmd must not be empty"));
    }
    for pattern in &policy.test_path_patterns {
        regex::Regex::new(pattern)
            .with_context(|| format!("compile test_path_patterns entry {pattern:?}"))?;
    }
    for pattern in &policy.advice_quality_gate.anti_praise_regex {
        regex::Regex::new(pattern)
            .with_context(|| format!("compile anti_praise_regex entry {pattern:?}"))?;
    }
    regex::Regex::new(&policy.advice_quality_gate.imperative_verb_regex)
        .context("compile imperative_verb_regex")?;
    Ok(())
}
