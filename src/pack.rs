//! Pack loading and load-time validation.
//!
//! A pack is the ordered list of audit questions plus the response contract
//! and validation policy. Validation is front-loaded: anything that can fail
//! deterministically (regex compilation, duplicate ids, dangling cross-step
//! references, unknown compactors) fails here, before any engine runs.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::evidence::transform::filter_fn_exists;

/// Current schema version for pack files.
pub const PACK_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackType {
    Audit,
    /// Mission packs promote advice-quality violations to fatal issues.
    Mission,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    #[default]
    Llm,
    Deterministic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceMode {
    #[default]
    None,
    Llm,
}

/// Evidence rendering modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Bulleted rows.
    #[default]
    List,
    /// Fenced code block.
    Block,
    /// One line per row.
    Lines,
    /// Raw pretty JSON.
    Json,
}

/// Cross-step path narrowing: rank paths in an earlier step's rows by a
/// count field and restrict downstream rows to the top-N path set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupByPathTopN {
    pub step: String,
    pub count_key: String,
    pub n: usize,
    #[serde(default = "default_per_path_cap")]
    pub per_path_cap: usize,
}

fn default_per_path_cap() -> usize {
    5
}

/// Declarative filter pipeline applied to the row portion of an artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub excludes: Vec<String>,
    pub includes: Vec<String>,
    pub exclude_test_files: bool,
    pub test_path_patterns: Vec<String>,
    pub exclude_comments: bool,
    pub require_regex: Vec<String>,
    pub require_contains: Vec<String>,
    pub group_by_path_top_n: Option<GroupByPathTopN>,
    pub filter_fn: Option<String>,
    pub max_items: Option<usize>,
    pub max_chars: Option<usize>,
}

/// One deterministic preflight command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightStep {
    pub name: String,
    /// Engine override; the pack-level engine applies when absent.
    #[serde(default)]
    pub engine: Option<String>,
    /// Argv template with `{parquet}` / `{target_dir}` placeholders.
    pub argv: Vec<String>,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub render: RenderMode,
    /// Skip remaining steps once this one produces rows.
    #[serde(default)]
    pub stop_if_nonempty: bool,
}

/// Sampling and backend parameters for chat dispatches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatParams {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub num_ctx: Option<u32>,
}

impl ChatParams {
    /// Layer `other` over `self`, keeping `self` values where `other` is unset.
    pub fn overlaid(&self, other: &ChatParams) -> ChatParams {
        ChatParams {
            backend: other.backend.clone().or_else(|| self.backend.clone()),
            model: other.model.clone().or_else(|| self.model.clone()),
            top_k: other.top_k.or(self.top_k),
            max_tokens: other.max_tokens.or(self.max_tokens),
            temperature: other.temperature.or(self.temperature),
            top_p: other.top_p.or(self.top_p),
            num_ctx: other.num_ctx.or(self.num_ctx),
        }
    }
}

/// One audit question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
    pub question_text: String,
    #[serde(default)]
    pub preflight: Vec<PreflightStep>,
    #[serde(default)]
    pub chat: Option<ChatParams>,
    #[serde(default)]
    pub response_mode: ResponseMode,
    #[serde(default)]
    pub advice_mode: AdviceMode,
    #[serde(default)]
    pub expected_verdict: Option<String>,
    #[serde(default)]
    pub advice_prompt_override: Option<String>,
}

/// Required header lines and provenance enforcement switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseContract {
    pub verdict_line_prefix: String,
    pub verdict_values: Vec<String>,
    pub citations_line_prefix: String,
    pub enforce_citations_from_evidence: bool,
    pub enforce_no_new_paths: bool,
    pub enforce_paths_must_be_cited: bool,
    pub fail_on_missing_citations: bool,
    /// Extra contract rules rendered verbatim into the prompt.
    pub extra_rules: Vec<String>,
}

impl Default for ResponseContract {
    fn default() -> Self {
        ResponseContract {
            verdict_line_prefix: "VERDICT=".to_string(),
            verdict_values: vec![
                "TRUE_POSITIVE".to_string(),
                "FALSE_POSITIVE".to_string(),
                "NEEDS_REVIEW".to_string(),
            ],
            citations_line_prefix: "CITATIONS=".to_string(),
            enforce_citations_from_evidence: true,
            enforce_no_new_paths: true,
            enforce_paths_must_be_cited: true,
            fail_on_missing_citations: true,
            extra_rules: Vec::new(),
        }
    }
}

impl ResponseContract {
    /// Render the contract as the numbered rule list embedded in prompts.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str("Response contract:\n");
        out.push_str(&format!(
            "1. The first line must be `{}<value>` where <value> is one of: {}.\n",
            self.verdict_line_prefix,
            self.verdict_values.join(", ")
        ));
        out.push_str(&format!(
            "2. The second line must be `{}<token>[, <token>...]` listing every citation.\n",
            self.citations_line_prefix
        ));
        out.push_str(
            "3. Citation tokens must be `path:line`, `path:start-end`, or a CITE anchor listed below.\n",
        );
        let mut rule = 4;
        if self.enforce_citations_from_evidence {
            out.push_str(&format!(
                "{rule}. Cite only tokens that appear in the provided evidence.\n"
            ));
            rule += 1;
        }
        if self.enforce_no_new_paths {
            out.push_str(&format!(
                "{rule}. Do not mention repository paths absent from the evidence.\n"
            ));
            rule += 1;
        }
        if self.enforce_paths_must_be_cited {
            out.push_str(&format!(
                "{rule}. Every path mentioned in the body must also be cited.\n"
            ));
            rule += 1;
        }
        for extra in &self.extra_rules {
            out.push_str(&format!("{rule}. {extra}\n"));
            rule += 1;
        }
        out
    }
}

/// Pack-level validation knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    pub min_questions: Option<usize>,
    /// Reject path-only citation matches when line ranges do not overlap.
    pub strict_line_overlap: bool,
    pub elevate_starvation: Option<bool>,
}

/// Pack-scoped overrides layered over the runner policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOverrides {
    pub excludes: Vec<String>,
    pub includes: Vec<String>,
    pub starvation_threshold: Option<usize>,
    pub default_max_items: Option<usize>,
    pub default_max_chars: Option<usize>,
}

/// A loaded, validated audit pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    pub version: u32,
    pub pack_type: PackType,
    /// Default engine for preflight and chat.
    pub engine: String,
    #[serde(default)]
    pub response_schema: ResponseContract,
    #[serde(default)]
    pub defaults: ChatParams,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub validation: Option<ValidationPolicy>,
    #[serde(default)]
    pub runner: Option<RunnerOverrides>,
}

impl Pack {
    pub fn is_mission(&self) -> bool {
        matches!(self.pack_type, PackType::Mission)
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        self.validation.clone().unwrap_or_default()
    }

    /// Engine names referenced anywhere in the pack, deduplicated.
    pub fn referenced_engines(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        names.insert(self.engine.clone());
        for question in &self.questions {
            for step in &question.preflight {
                if let Some(engine) = &step.engine {
                    names.insert(engine.clone());
                }
            }
        }
        names.into_iter().collect()
    }
}

/// Load and validate a pack file.
pub fn load_pack(path: &Path) -> Result<Pack> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read pack {}", path.display()))?;
    let pack: Pack = serde_yaml::from_str(&text).context("parse pack YAML")?;
    validate_pack(&pack)?;
    Ok(pack)
}

/// Validate pack structure, ids, regexes, and cross-step references.
pub fn validate_pack(pack: &Pack) -> Result<()> {
    if pack.version != PACK_SCHEMA_VERSION {
        return Err(anyhow!("unsupported pack version {}", pack.version));
    }
    if pack.questions.is_empty() {
        return Err(anyhow!("pack declares no questions"));
    }
    if let Some(min) = pack.validation_policy().min_questions {
        if pack.questions.len() < min {
            return Err(anyhow!(
                "pack has {} questions but validation.min_questions is {min}",
                pack.questions.len()
            ));
        }
    }
    if pack.response_schema.verdict_values.is_empty() {
        return Err(anyhow!("response_schema.verdict_values must not be empty"));
    }

    let mut seen_ids = BTreeSet::new();
    for question in &pack.questions {
        if question.id.trim().is_empty() {
            return Err(anyhow!("question id must not be empty"));
        }
        if !seen_ids.insert(question.id.clone()) {
            return Err(anyhow!("duplicate question id {:?}", question.id));
        }
        if let Some(expected) = &question.expected_verdict {
            if !pack.response_schema.verdict_values.contains(expected) {
                return Err(anyhow!(
                    "question {:?} expected_verdict {expected:?} is not a contract verdict",
                    question.id
                ));
            }
        }
        validate_question_steps(question)?;
    }
    Ok(())
}

fn validate_question_steps(question: &Question) -> Result<()> {
    let mut earlier_steps: BTreeSet<&str> = BTreeSet::new();
    let mut seen_names = BTreeSet::new();
    for step in &question.preflight {
        if step.name.trim().is_empty() {
            return Err(anyhow!("question {:?} has a step with no name", question.id));
        }
        if !seen_names.insert(step.name.as_str()) {
            return Err(anyhow!(
                "question {:?} duplicates step name {:?}",
                question.id,
                step.name
            ));
        }
        if step.argv.is_empty() {
            return Err(anyhow!(
                "question {:?} step {:?} has an empty argv",
                question.id,
                step.name
            ));
        }
        if let Some(transform) = &step.transform {
            validate_transform(transform, &question.id, &step.name, &earlier_steps)?;
        }
        earlier_steps.insert(step.name.as_str());
    }
    Ok(())
}

fn validate_transform(
    transform: &Transform,
    qid: &str,
    step: &str,
    earlier_steps: &BTreeSet<&str>,
) -> Result<()> {
    for pattern in transform
        .require_regex
        .iter()
        .chain(transform.test_path_patterns.iter())
    {
        Regex::new(pattern).with_context(|| {
            format!("question {qid:?} step {step:?}: compile pattern {pattern:?}")
        })?;
    }
    if let Some(name) = &transform.filter_fn {
        if !filter_fn_exists(name) {
            return Err(anyhow!(
                "question {qid:?} step {step:?} names unknown filter_fn {name:?}"
            ));
        }
    }
    if let Some(group) = &transform.group_by_path_top_n {
        if group.n == 0 {
            return Err(anyhow!(
                "question {qid:?} step {step:?}: group_by_path_top_n.n must be > 0"
            ));
        }
        if !earlier_steps.contains(group.step.as_str()) {
            return Err(anyhow!(
                "question {qid:?} step {step:?}: group_by_path_top_n references \
                 {:?} which is not an earlier step",
                group.step
            ));
        }
    }
    Ok(())
}
