//! Run artifact writers: report, manifest, evidence audit files.
//!
//! Wall-clock fields live only in the manifest, so every other artifact is
//! byte-stable across cached re-runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::audit::{EvidenceAuditRow, EvidenceDeliverySummary};
use crate::pack::Pack;
use crate::policy::RunnerPolicy;
use crate::workflow::{QuestionOutcome, RunConfig, RunOutcome};

/// Current schema version for the run manifest.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Machine-readable record of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub pack_path: PathBuf,
    pub parquet_path: PathBuf,
    pub index_path: Option<PathBuf>,
    pub target_dir: PathBuf,
    pub out_dir: PathBuf,
    pub engine: String,
    pub seed: Option<u64>,
    pub questions: Vec<QuestionOutcome>,
    pub fatal_contract_issues: Vec<String>,
    pub fatal_advice_gate_issues: Vec<String>,
    pub exit_code: i32,
    pub started_at_epoch_ms: u128,
    pub finished_at_epoch_ms: u128,
}

pub fn now_epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize JSON artifact")?;
    fs::write(path, json).with_context(|| format!("write {}", path.display()))
}

pub fn write_audit_row(out_dir: &Path, qid: &str, row: &EvidenceAuditRow) -> Result<()> {
    let path = out_dir.join(format!("{qid}_evidence_delivery_audit.json"));
    write_json(&path, row)
}

pub fn write_evidence_summary(
    out_dir: &Path,
    policy: &RunnerPolicy,
    summary: &EvidenceDeliverySummary,
) -> Result<()> {
    let filename = policy.resolve_filename(&policy.evidence_audit_summary_filename);
    write_json(&out_dir.join(filename), summary)
}

pub fn write_manifest(
    config: &RunConfig,
    pack: &Pack,
    outcome: &RunOutcome,
    started_at: u128,
) -> Result<()> {
    let manifest = RunManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        pack_path: config.pack_path.clone(),
        parquet_path: config.parquet.clone(),
        index_path: config.index.clone(),
        target_dir: config.target_dir.clone(),
        out_dir: config.out_dir.clone(),
        engine: pack.engine.clone(),
        seed: config.seed,
        questions: outcome.questions.clone(),
        fatal_contract_issues: outcome.fatal_contract_issues.clone(),
        fatal_advice_gate_issues: outcome.fatal_advice_gate_issues.clone(),
        exit_code: outcome.exit_code,
        started_at_epoch_ms: started_at,
        finished_at_epoch_ms: now_epoch_ms(),
    };
    let filename = config.policy.resolve_filename(&config.policy.manifest_filename);
    write_json(&config.out_dir.join(filename), &manifest)
}

/// Render the human-readable aggregate report.
pub fn write_report(
    out_dir: &Path,
    policy: &RunnerPolicy,
    pack: &Pack,
    outcome: &RunOutcome,
    summary: &EvidenceDeliverySummary,
) -> Result<()> {
    let mut out = String::new();
    out.push_str("# Audit Pack Report\n\n");
    out.push_str(&format!(
        "- engine: `{}`\n- questions: {}\n- exit code: {}\n",
        pack.engine,
        outcome.questions.len(),
        outcome.exit_code
    ));
    out.push_str(&format!(
        "- evidence paths missing from table: {}\n\n",
        summary.total_missing_paths_from_parquet
    ));

    if !outcome.fatal_contract_issues.is_empty() {
        out.push_str("## Fatal contract issues\n\n");
        for issue in &outcome.fatal_contract_issues {
            out.push_str(&format!("- {issue}\n"));
        }
        out.push('\n');
    }
    if !outcome.fatal_advice_gate_issues.is_empty() {
        out.push_str("## Fatal advice gate issues\n\n");
        for issue in &outcome.fatal_advice_gate_issues {
            out.push_str(&format!("- {issue}\n"));
        }
        out.push('\n');
    }

    out.push_str("## Questions\n\n");
    for question in &outcome.questions {
        render_question_section(&mut out, question);
    }

    let filename = policy.resolve_filename(&policy.report_filename);
    let path = out_dir.join(filename);
    fs::write(&path, out).with_context(|| format!("write {}", path.display()))
}

fn render_question_section(out: &mut String, question: &QuestionOutcome) {
    out.push_str(&format!("### {} - {}\n\n", question.id, question.title));
    if question.skipped {
        out.push_str("Skipped: the run aborted before this question.\n\n");
        return;
    }
    out.push_str(&format!(
        "- verdict: {}\n- evidence blocks: {}\n- preflight steps: {} ({} cached)\n- dispatches: {}\n",
        question.verdict.as_deref().unwrap_or("(none)"),
        question.evidence_blocks,
        question.preflight_steps,
        question.cached_steps,
        question.dispatches,
    ));
    if let Some(validated) = question.advice_validated {
        out.push_str(&format!(
            "- advice: {}\n",
            if validated { "validated" } else { "failed validation" }
        ));
    }

    let mut issues = Vec::new();
    issues.extend(question.schema_issues.iter().cloned());
    issues.extend(question.provenance_issues.iter().cloned());
    issues.extend(question.path_gate_issues.iter().cloned());
    if issues.is_empty() && question.advice_quality_issues.is_empty() {
        out.push_str("- validator: clean\n");
    } else {
        out.push_str("- validator issues:\n");
        for issue in &issues {
            out.push_str(&format!("  - {issue}\n"));
        }
        for issue in &question.advice_quality_issues {
            out.push_str(&format!("  - advice: {issue}\n"));
        }
    }
    for diagnostic in &question.filter_diagnostics {
        out.push_str(&format!(
            "- diagnostic: {} on step {} ({} -> {} rows)\n",
            diagnostic.kind, diagnostic.step, diagnostic.pre_filter, diagnostic.post_filter
        ));
    }
    out.push('\n');
}
