//! LLM dispatch through the engine's chat subcommand.
//!
//! The runner never speaks to a model directly. It invokes the engine chat
//! CLI with the composed prompt file, a mode-specific system prompt file,
//! and the resolved sampling parameters, then records a dispatch descriptor
//! (prompt hash and size) for the evidence audit.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

use crate::engines::EngineSpec;
use crate::evidence::EvidenceSet;
use crate::pack::{ChatParams, Question, ResponseContract};
use crate::util::signature_hex;

/// Audit record of one chat dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchDescriptor {
    pub phase: String,
    pub prompt_sha256: String,
    pub prompt_chars: usize,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub top_k: Option<u32>,
}

/// Parsed chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Everything persisted to `<QID>_chat.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub phase: String,
    pub argv: Vec<String>,
    pub descriptor: DispatchDescriptor,
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Fixed per-run chat inputs.
#[derive(Debug, Clone)]
pub struct ChatInputs {
    pub parquet: std::path::PathBuf,
    pub index: Option<std::path::PathBuf>,
    pub target_dir: std::path::PathBuf,
    pub seed: Option<u64>,
}

/// Resolve the effective top-k for a dispatch.
///
/// Adaptive mode raises the initial top-k to the evidence row count when the
/// evidence is larger, bounded by `cap`.
pub fn resolve_top_k(
    adaptive: bool,
    initial: Option<u32>,
    evidence_rows: usize,
    cap: usize,
) -> Option<u32> {
    if !adaptive {
        return initial;
    }
    let initial = initial.unwrap_or(8);
    let wanted = initial.max(u32::try_from(evidence_rows).unwrap_or(u32::MAX));
    let capped = if cap > 0 {
        wanted.min(u32::try_from(cap).unwrap_or(u32::MAX))
    } else {
        wanted
    };
    Some(capped)
}

/// Build the chat argv for one dispatch.
pub fn build_chat_argv(
    engine: &EngineSpec,
    params: &ChatParams,
    inputs: &ChatInputs,
    prompt_file: &Path,
    system_prompt_file: &Path,
) -> Vec<String> {
    let chat = &engine.chat;
    let mut argv = engine.invocation.clone();
    argv.push(chat.subcommand.clone());

    if let Some(index) = &inputs.index {
        argv.push(engine.index_flag.clone());
        argv.push(index.display().to_string());
    }
    argv.push(engine.parquet_flag.clone());
    argv.push(inputs.parquet.display().to_string());
    if let Some(flag) = &engine.target_dir_flag {
        argv.push(flag.clone());
        argv.push(inputs.target_dir.display().to_string());
    }

    if let Some(backend) = &params.backend {
        argv.push(chat.backend_flag.clone());
        argv.push(backend.clone());
    }
    if let Some(model) = &params.model {
        argv.push(chat.model_flag.clone());
        argv.push(model.clone());
    }
    if let Some(top_k) = params.top_k {
        argv.push(chat.top_k_flag.clone());
        argv.push(top_k.to_string());
    }
    if let Some(max_tokens) = params.max_tokens {
        argv.push(chat.max_tokens_flag.clone());
        argv.push(max_tokens.to_string());
    }
    if let Some(temperature) = params.temperature {
        argv.push(chat.temperature_flag.clone());
        argv.push(temperature.to_string());
    }
    if let Some(top_p) = params.top_p {
        argv.push(chat.top_p_flag.clone());
        argv.push(top_p.to_string());
    }
    if let Some(num_ctx) = params.num_ctx {
        argv.push(chat.num_ctx_flag.clone());
        argv.push(num_ctx.to_string());
    }
    if let Some(seed) = inputs.seed {
        argv.push(chat.seed_flag.clone());
        argv.push(seed.to_string());
    }

    argv.push(chat.system_prompt_flag.clone());
    argv.push(system_prompt_file.display().to_string());
    argv.push(chat.prompt_flag.clone());
    argv.push(prompt_file.display().to_string());
    argv
}

/// Dispatch one prompt and return the record for persistence.
pub fn dispatch(
    engine: &EngineSpec,
    params: &ChatParams,
    inputs: &ChatInputs,
    phase: &str,
    prompt_text: &str,
    prompt_file: &Path,
    system_prompt_file: &Path,
) -> Result<ChatRecord> {
    let argv = build_chat_argv(engine, params, inputs, prompt_file, system_prompt_file);
    let descriptor = DispatchDescriptor {
        phase: phase.to_string(),
        prompt_sha256: signature_hex(&[prompt_text]),
        prompt_chars: prompt_text.chars().count(),
        backend: params.backend.clone(),
        model: params.model.clone(),
        top_k: params.top_k,
    };

    let program = argv
        .first()
        .ok_or_else(|| anyhow!("chat argv is empty"))?
        .clone();
    let started = Instant::now();
    let output = Command::new(&program)
        .args(&argv[1..])
        .output()
        .with_context(|| format!("run chat command {program:?}"))?;
    let elapsed_ms = started.elapsed().as_millis();
    tracing::info!(
        phase,
        prompt_chars = descriptor.prompt_chars,
        elapsed_ms,
        "chat dispatch complete"
    );

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "chat command failed with status {}: {}",
            output.status,
            stderr.trim().lines().next().unwrap_or_default()
        ));
    }

    let response = parse_chat_response(&output.stdout)?;
    Ok(ChatRecord {
        phase: phase.to_string(),
        argv,
        descriptor,
        answer: response.answer,
        sources: response.sources,
    })
}

/// Parse chat stdout, tolerating a JSON envelope or raw text.
pub fn parse_chat_response(stdout: &[u8]) -> Result<ChatResponse> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("chat command produced no output"));
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Value::Object(map) = &value {
            let answer = ["answer", "result", "response"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str));
            if let Some(answer) = answer {
                let sources = map
                    .get("sources")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                return Ok(ChatResponse {
                    answer: answer.to_string(),
                    sources,
                });
            }
        }
    }
    Ok(ChatResponse {
        answer: trimmed.to_string(),
        sources: Vec::new(),
    })
}

/// Synthesize a deterministic answer from evidence, bypassing the LLM.
pub fn synthesize_deterministic(
    question: &Question,
    contract: &ResponseContract,
    evidence: &EvidenceSet,
) -> ChatRecord {
    let verdict = question
        .expected_verdict
        .clone()
        .or_else(|| contract.verdict_values.first().cloned())
        .unwrap_or_else(|| "NEEDS_REVIEW".to_string());

    let tokens = evidence.allowed_tokens();
    let mut answer = String::new();
    answer.push_str(&contract.verdict_line_prefix);
    answer.push_str(&verdict);
    answer.push('\n');
    answer.push_str(&contract.citations_line_prefix);
    answer.push_str(&tokens.join(", "));
    answer.push('\n');
    for block in &evidence.blocks {
        answer.push_str(&format!(
            "Evidence step {} produced {} rows.\n",
            block.step, block.row_count
        ));
    }

    ChatRecord {
        phase: "deterministic".to_string(),
        argv: Vec::new(),
        descriptor: DispatchDescriptor {
            phase: "deterministic".to_string(),
            prompt_sha256: String::new(),
            prompt_chars: 0,
            backend: None,
            model: None,
            top_k: None,
        },
        answer,
        sources: tokens,
    }
}
