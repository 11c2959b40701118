//! Run coordination: the per-question state machine and fatal aggregation.
//!
//! Questions run strictly in pack order; steps within a question run
//! strictly in declaration order. The coordinator owns the preflight
//! signature cache and the fatal-issue lists, writes every artifact as it is
//! produced, and writes the manifest last so an interrupted run is
//! recognizable by its absence.

pub mod replicate;
pub mod report;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::advice;
use crate::audit::{self, EvidenceAuditRow};
use crate::contract::{discover_contract, SchemaContract};
use crate::dispatch::{self, ChatInputs, ChatRecord, DispatchDescriptor};
use crate::engines::EngineRegistry;
use crate::evidence::render::render_block;
use crate::evidence::transform::{apply_transform, FilterDiagnostic, FilterSettings};
use crate::evidence::EvidenceSet;
use crate::pack::{AdviceMode, ChatParams, Pack, Question, ResponseMode};
use crate::policy::RunnerPolicy;
use crate::preflight::{self, PreflightInputs, SignatureCache};
use crate::prompt::{self, QuoteBypassMode, SystemPrompts};
use crate::repair::repair_answer;
use crate::table::{load_catalog, TableCatalog};
use crate::validate::{parse_answer, validate_answer};

/// Resolved inputs and knobs for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub out_dir: PathBuf,
    pub pack_path: PathBuf,
    pub parquet: PathBuf,
    pub index: Option<PathBuf>,
    pub target_dir: PathBuf,
    pub policy: RunnerPolicy,
    pub cli_chat: ChatParams,
    pub system_prompts: SystemPrompts,
    pub quote_bypass_mode: QuoteBypassMode,
    /// CLI override of the policy's empty-evidence gate.
    pub evidence_empty_gate: Option<bool>,
    pub cache_preflights: bool,
    pub short_circuit_preflights: bool,
    pub adaptive_top_k: bool,
    pub chat_top_k_initial: Option<u32>,
    pub seed: Option<u64>,
}

/// Per-question outcome recorded in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOutcome {
    pub id: String,
    pub title: String,
    pub verdict: Option<String>,
    pub evidence_blocks: usize,
    pub preflight_steps: usize,
    pub cached_steps: usize,
    pub dispatches: usize,
    pub schema_issues: Vec<String>,
    pub provenance_issues: Vec<String>,
    pub path_gate_issues: Vec<String>,
    pub filter_diagnostics: Vec<FilterDiagnostic>,
    pub advice_validated: Option<bool>,
    pub advice_quality_issues: Vec<String>,
    /// Set when the run aborted before this question completed.
    pub skipped: bool,
}

/// Aggregate result of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub fatal_contract_issues: Vec<String>,
    pub fatal_advice_gate_issues: Vec<String>,
    pub questions: Vec<QuestionOutcome>,
    pub exit_code: i32,
}

/// Execute a loaded pack end to end and write all run artifacts.
pub fn execute_run(
    config: &RunConfig,
    pack: &Pack,
    registry: &EngineRegistry,
) -> Result<RunOutcome> {
    fs::create_dir_all(&config.out_dir)
        .with_context(|| format!("create out dir {}", config.out_dir.display()))?;

    let started_at = report::now_epoch_ms();
    let catalog = load_catalog(&config.policy.catalog_cmd, &config.parquet)?;
    let settings = FilterSettings::from_policy(&config.policy, pack.runner.as_ref());
    let validation = pack.validation_policy();
    let elevate_starvation = validation
        .elevate_starvation
        .unwrap_or(config.policy.elevate_starvation);

    let fail_fast = config.policy.evidence_presence_gate.fail_fast;
    let system_files = write_system_prompt_files(&config.out_dir, &config.system_prompts)?;

    let preflight_inputs = PreflightInputs {
        pack_path: config.pack_path.clone(),
        parquet: config.parquet.clone(),
        index: config.index.clone(),
        target_dir: config.target_dir.clone(),
        cache_enabled: config.cache_preflights,
        timeout: config.policy.preflight_timeout_secs.map(Duration::from_secs),
    };
    let chat_inputs = ChatInputs {
        parquet: config.parquet.clone(),
        index: config.index.clone(),
        target_dir: config.target_dir.clone(),
        seed: config.seed,
    };

    let mut cache = SignatureCache::new();
    let mut fatal_contract_issues = Vec::new();
    let mut fatal_advice_gate_issues = Vec::new();
    let mut outcomes = Vec::new();
    let mut audit_rows = Vec::new();
    let mut aborted = false;

    for question in &pack.questions {
        if aborted {
            outcomes.push(skipped_outcome(question));
            continue;
        }
        let context = QuestionContext {
            config,
            pack,
            registry,
            catalog: &catalog,
            settings: &settings,
            strict_line_overlap: validation.strict_line_overlap,
            elevate_starvation,
            preflight_inputs: &preflight_inputs,
            chat_inputs: &chat_inputs,
            system_files: &system_files,
        };
        let record = run_question(&context, question, &mut cache)?;

        fatal_contract_issues.extend(record.fatal_contract_issues);
        fatal_advice_gate_issues.extend(record.fatal_advice_gate_issues);
        audit_rows.push(record.audit_row);
        outcomes.push(record.outcome);

        if record.abort_run && fail_fast {
            tracing::error!(qid = %question.id, "empty-evidence gate tripped; aborting run");
            aborted = true;
        }
    }

    // Run-end evidence audit aggregation is itself fail-closed.
    let summary = audit::summarize(audit_rows);
    if summary.total_missing_paths_from_parquet > 0 {
        fatal_contract_issues.push(format!(
            "evidence audit: {} path(s) referenced in prompt evidence are missing \
             from the table path universe",
            summary.total_missing_paths_from_parquet
        ));
    }
    report::write_evidence_summary(&config.out_dir, &config.policy, &summary)?;

    let exit_code = if fatal_contract_issues.is_empty() && fatal_advice_gate_issues.is_empty() {
        0
    } else {
        2
    };

    let outcome = RunOutcome {
        fatal_contract_issues,
        fatal_advice_gate_issues,
        questions: outcomes,
        exit_code,
    };

    report::write_report(&config.out_dir, &config.policy, pack, &outcome, &summary)?;
    // The manifest is written last: its presence marks a completed run.
    report::write_manifest(config, pack, &outcome, started_at)?;

    tracing::info!(
        exit_code,
        fatal_contract = outcome.fatal_contract_issues.len(),
        fatal_advice = outcome.fatal_advice_gate_issues.len(),
        "run complete"
    );
    Ok(outcome)
}

struct QuestionContext<'a> {
    config: &'a RunConfig,
    pack: &'a Pack,
    registry: &'a EngineRegistry,
    catalog: &'a TableCatalog,
    settings: &'a FilterSettings,
    strict_line_overlap: bool,
    elevate_starvation: bool,
    preflight_inputs: &'a PreflightInputs,
    chat_inputs: &'a ChatInputs,
    system_files: &'a SystemPromptFiles,
}

struct QuestionRecord {
    outcome: QuestionOutcome,
    audit_row: EvidenceAuditRow,
    fatal_contract_issues: Vec<String>,
    fatal_advice_gate_issues: Vec<String>,
    /// Empty-evidence gate tripped; the coordinator decides whether to abort.
    abort_run: bool,
}

struct SystemPromptFiles {
    grounding: PathBuf,
    analyze: PathBuf,
}

fn write_system_prompt_files(out_dir: &Path, prompts: &SystemPrompts) -> Result<SystemPromptFiles> {
    let grounding = out_dir.join("_system_grounding.md");
    let analyze = out_dir.join("_system_analyze.md");
    fs::write(&grounding, &prompts.grounding)
        .with_context(|| format!("write {}", grounding.display()))?;
    fs::write(&analyze, &prompts.analyze)
        .with_context(|| format!("write {}", analyze.display()))?;
    Ok(SystemPromptFiles { grounding, analyze })
}

fn skipped_outcome(question: &Question) -> QuestionOutcome {
    QuestionOutcome {
        id: question.id.clone(),
        title: question.title.clone(),
        verdict: None,
        evidence_blocks: 0,
        preflight_steps: 0,
        cached_steps: 0,
        dispatches: 0,
        schema_issues: Vec::new(),
        provenance_issues: Vec::new(),
        path_gate_issues: Vec::new(),
        filter_diagnostics: Vec::new(),
        advice_validated: None,
        advice_quality_issues: Vec::new(),
        skipped: true,
    }
}

fn run_question(
    context: &QuestionContext<'_>,
    question: &Question,
    cache: &mut SignatureCache,
) -> Result<QuestionRecord> {
    let config = context.config;
    let pack = context.pack;
    let qid = &question.id;
    tracing::info!(qid = %qid, title = %question.title, "question start");

    // Preflight phase: execute steps serially, honoring short-circuit.
    let mut artifacts = Vec::new();
    let mut cached_steps = 0;
    for step in &question.preflight {
        let engine_name = step.engine.as_deref().unwrap_or(&pack.engine);
        let engine = context.registry.get(engine_name)?;
        let artifact_path = config.out_dir.join(format!("{qid}_{}.json", step.name));
        let artifact = preflight::run_step(
            engine,
            &step.argv,
            context.preflight_inputs,
            &artifact_path,
            cache,
        )?;
        if artifact.cached {
            cached_steps += 1;
        }
        let has_rows = artifact.has_rows();
        artifacts.push((step, artifact, artifact_path));
        if config.short_circuit_preflights && step.stop_if_nonempty && has_rows {
            tracing::info!(qid = %qid, step = %step.name, "short-circuit: step produced rows");
            break;
        }
    }

    // Schema contract discovery, logged per question for auditability.
    let observed_rows: Vec<serde_json::Value> = artifacts
        .iter()
        .flat_map(|(_, artifact, _)| artifact.original_rows())
        .collect();
    let engine = context.registry.get(&pack.engine)?;
    let contract = discover_contract(engine, context.catalog, &observed_rows)?;
    tracing::info!(
        qid = %qid,
        source = contract.source.as_str(),
        path_keys = %contract.path_keys.join(","),
        line_keys = %contract.line_keys.join(","),
        snippet_keys = %contract.snippet_keys.join(","),
        "schema contract resolved"
    );

    // Transform phase: filter each artifact in order, then render.
    let mut diagnostics = Vec::new();
    let mut earlier_rows: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
    let mut evidence = EvidenceSet::default();
    for (step, artifact, artifact_path) in &mut artifacts {
        let outcome = apply_transform(
            &step.name,
            artifact.original_rows(),
            step.transform.as_ref(),
            &contract,
            context.settings,
            &earlier_rows,
        )?;
        diagnostics.extend(outcome.diagnostics.clone());
        artifact.apply_filtered_rows(outcome.rows.clone());
        preflight::write_artifact(artifact_path, artifact)?;
        earlier_rows.insert(step.name.clone(), outcome.rows.clone());

        if let Some(block) =
            maybe_render_block(qid, step, artifact, &outcome.rows, &contract, config)
        {
            evidence.blocks.push(block);
        }
    }

    let mut fatal_contract_issues = Vec::new();
    if context.elevate_starvation {
        for diagnostic in &diagnostics {
            fatal_contract_issues.push(format!(
                "question {qid}: step {} filtered_to_zero ({} -> 0 rows)",
                diagnostic.step, diagnostic.pre_filter
            ));
        }
    }

    // Empty-evidence gate: decided solely by the block count.
    let mut gate_enabled = config.policy.evidence_presence_gate.fail_on_empty_evidence;
    if let Some(enabled) = config.evidence_empty_gate {
        gate_enabled = enabled;
    }
    if evidence.is_empty() && gate_enabled {
        fatal_contract_issues.push(format!("question {qid} produced no evidence blocks"));
        let audit_row = audit::audit_question(
            qid,
            &evidence,
            context.catalog,
            &config.target_dir,
            Vec::new(),
        );
        report::write_audit_row(&config.out_dir, qid, &audit_row)?;
        let mut outcome = skipped_outcome(question);
        outcome.skipped = false;
        outcome.preflight_steps = question.preflight.len();
        outcome.cached_steps = cached_steps;
        outcome.filter_diagnostics = diagnostics;
        return Ok(QuestionRecord {
            outcome,
            audit_row,
            fatal_contract_issues,
            fatal_advice_gate_issues: Vec::new(),
            abort_run: true,
        });
    }

    // Compose and dispatch.
    let style = prompt::select_style(config.quote_bypass_mode, &evidence);
    tracing::info!(
        qid = %qid,
        style = style.as_str(),
        blocks = evidence.len(),
        "prompt composed"
    );
    let composed = prompt::compose(question, &pack.response_schema, &evidence, style);
    let prompt_path = config.out_dir.join(style.prompt_filename(qid));
    fs::write(&prompt_path, &composed.text)
        .with_context(|| format!("write {}", prompt_path.display()))?;

    let mut descriptors: Vec<DispatchDescriptor> = Vec::new();
    let evidence_rows: usize = evidence.blocks.iter().map(|block| block.row_count).sum();
    let mut params = pack
        .defaults
        .overlaid(question.chat.as_ref().unwrap_or(&ChatParams::default()))
        .overlaid(&config.cli_chat);
    params.top_k = dispatch::resolve_top_k(
        config.adaptive_top_k,
        config.chat_top_k_initial.or(params.top_k),
        evidence_rows,
        config.policy.issue_caps.advice_top_k_cap,
    );

    let system_file = match style {
        prompt::PromptStyle::Grounding => &context.system_files.grounding,
        prompt::PromptStyle::QuoteBypass => &context.system_files.analyze,
    };

    let chat_record = match question.response_mode {
        ResponseMode::Deterministic => {
            dispatch::synthesize_deterministic(question, &pack.response_schema, &evidence)
        }
        ResponseMode::Llm => {
            let record = dispatch::dispatch(
                engine,
                &params,
                context.chat_inputs,
                "chat",
                &composed.text,
                &prompt_path,
                system_file,
            )?;
            descriptors.push(record.descriptor.clone());
            record
        }
    };

    // Provenance repair, then persist so the validator and report observe
    // the repaired answer.
    let repaired = repair_answer(&chat_record.answer, &pack.response_schema, &evidence);
    if repaired.changed() {
        tracing::info!(
            qid = %qid,
            appended = %repaired.appended.join(", "),
            "provenance repair appended citations"
        );
    }
    let final_record = ChatRecord {
        answer: repaired.answer.clone(),
        ..chat_record
    };
    let chat_path = config.out_dir.join(format!("{qid}_chat.json"));
    report::write_json(&chat_path, &final_record)?;

    // Validation.
    let validation = validate_answer(
        &repaired.answer,
        &pack.response_schema,
        &evidence,
        context.strict_line_overlap,
        &config.policy.issue_caps,
    );
    if pack.response_schema.fail_on_missing_citations && !validation.is_clean() {
        for issue in validation.all_issues() {
            fatal_contract_issues.push(format!("question {qid}: {issue}"));
        }
    }

    // Advice pass.
    let mut advice_validated = None;
    let mut advice_quality_issues = Vec::new();
    let mut fatal_advice_gate_issues = Vec::new();
    if question.advice_mode == AdviceMode::Llm && !evidence.is_empty() {
        let advice_params = ChatParams {
            top_k: params.top_k.map(|top_k| {
                let cap = config.policy.issue_caps.advice_top_k_cap;
                if cap > 0 {
                    top_k.min(u32::try_from(cap).unwrap_or(u32::MAX))
                } else {
                    top_k
                }
            }),
            ..params.clone()
        };
        let advice_prompt_path = config.out_dir.join(format!("{qid}_advice_prompt.md"));
        let advice_chat_path = config.out_dir.join(format!("{qid}_advice_chat.json"));
        let advice_descriptors = &mut descriptors;
        let result = advice::run_advice(
            question,
            &repaired.answer,
            &evidence,
            &config.policy.advice_quality_gate,
            &config.policy.advice_retry,
            &config.policy.advice_template_notes,
            context.strict_line_overlap,
            pack.is_mission(),
            |phase, advice_prompt| {
                fs::write(&advice_prompt_path, advice_prompt)
                    .with_context(|| format!("write {}", advice_prompt_path.display()))?;
                // Advice always runs under the grounding-style system prompt
                // so the answer header contract is not imposed on it.
                let record = dispatch::dispatch(
                    engine,
                    &advice_params,
                    context.chat_inputs,
                    phase,
                    advice_prompt,
                    &advice_prompt_path,
                    &context.system_files.grounding,
                )?;
                advice_descriptors.push(record.descriptor.clone());
                report::write_json(&advice_chat_path, &record)?;
                Ok(record.answer)
            },
        )?;
        advice_validated = Some(result.validated);
        advice_quality_issues = result.quality_issues.clone();
        if !result.validated && pack.is_mission() {
            for issue in &result.quality_issues {
                fatal_advice_gate_issues.push(format!("question {qid}: {issue}"));
            }
        }
    }

    // Evidence audit row, written after all dispatches for the question.
    let audit_row = audit::audit_question(
        qid,
        &evidence,
        context.catalog,
        &config.target_dir,
        descriptors,
    );
    report::write_audit_row(&config.out_dir, qid, &audit_row)?;

    let header = parse_answer(&repaired.answer, &pack.response_schema);
    let outcome = QuestionOutcome {
        id: question.id.clone(),
        title: question.title.clone(),
        verdict: header.verdict,
        evidence_blocks: evidence.len(),
        preflight_steps: artifacts.len(),
        cached_steps,
        dispatches: audit_row.llm_dispatches.len(),
        schema_issues: validation.schema_issues.clone(),
        provenance_issues: validation.provenance_issues.clone(),
        path_gate_issues: validation.path_gate_issues.clone(),
        filter_diagnostics: diagnostics,
        advice_validated,
        advice_quality_issues,
        skipped: false,
    };

    Ok(QuestionRecord {
        outcome,
        audit_row,
        fatal_contract_issues,
        fatal_advice_gate_issues,
        abort_run: false,
    })
}

fn maybe_render_block(
    qid: &str,
    step: &crate::pack::PreflightStep,
    artifact: &preflight::PreflightArtifact,
    rows: &[serde_json::Value],
    contract: &SchemaContract,
    config: &RunConfig,
) -> Option<crate::evidence::EvidenceBlock> {
    let raw_text = artifact.stdout.as_str();
    let renderable_raw = matches!(step.render, crate::pack::RenderMode::Block)
        && artifact.returncode == 0
        && raw_text.is_some_and(|text| !text.trim().is_empty());
    if rows.is_empty() && !renderable_raw {
        return None;
    }
    let max_chars = step
        .transform
        .as_ref()
        .and_then(|transform| transform.max_chars)
        .unwrap_or(config.policy.default_max_chars);
    let basename = format!("{qid}_{}.json", step.name);
    Some(render_block(
        &step.name,
        step.render,
        rows,
        raw_text,
        &basename,
        contract,
        max_chars,
    ))
}
