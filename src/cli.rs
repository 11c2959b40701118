//! CLI argument parsing for the audit pack runner.
//!
//! The CLI is intentionally thin: it resolves inputs and knobs, then hands a
//! validated configuration to the coordinator, so the same core logic can be
//! reused elsewhere.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::prompt::QuoteBypassMode;

/// Root CLI entrypoint for the audit pack workflow.
#[derive(Parser, Debug)]
#[command(
    name = "packrun",
    version,
    about = "Deterministic, fail-closed audit pack runner",
    after_help = "Commands:\n  run    --out-dir <dir> --pack <pack.yaml> --parquet <facts.parquet>  Execute a pack\n  check  --pack <pack.yaml>                                            Validate pack/policy/engine specs\n\nExamples:\n  packrun run --out-dir nightly --pack packs/core.yaml --parquet facts.parquet \\\n      --index repo.idx --target-dir /src/repo --backend ollama --model qwen2.5\n  packrun run --out-dir /tmp/audit --pack packs/core.yaml --parquet facts.parquet \\\n      --replicate --replicate-seeds 1,2,3\n  packrun check --pack packs/core.yaml --engine-specs engines.yaml",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level workflow commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Check(CheckArgs),
}

/// Run command inputs for a single pack execution.
#[derive(Parser, Debug)]
#[command(about = "Execute an audit pack against a repository")]
pub struct RunArgs {
    /// Output directory; single-segment names resolve under the default base
    #[arg(long, value_name = "DIR")]
    pub out_dir: String,

    /// Pack file (YAML)
    #[arg(long, value_name = "PATH")]
    pub pack: PathBuf,

    /// Tabular storage file backing the engines
    #[arg(long, value_name = "PATH")]
    pub parquet: PathBuf,

    /// Engine index file
    #[arg(long, value_name = "PATH")]
    pub index: Option<PathBuf>,

    /// Audited repository root
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub target_dir: PathBuf,

    /// Engine specs file (YAML); built-in specs apply when omitted
    #[arg(long, value_name = "PATH")]
    pub engine_specs: Option<PathBuf>,

    /// Runner policy file (YAML); RUNNER_POLICY_PATH or defaults when omitted
    #[arg(long, value_name = "PATH")]
    pub policy: Option<PathBuf>,

    /// LLM backend name passed to the engine chat subcommand
    #[arg(long)]
    pub backend: Option<String>,

    /// Model override
    #[arg(long)]
    pub model: Option<String>,

    /// System prompt profile (default, terse)
    #[arg(long, default_value = "default")]
    pub prompt_profile: String,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long)]
    pub num_ctx: Option<u32>,

    /// Grounding-mode system prompt file override
    #[arg(long, value_name = "PATH")]
    pub system_prompt_grounding_file: Option<PathBuf>,

    /// Quote-bypass-mode system prompt file override
    #[arg(long, value_name = "PATH")]
    pub system_prompt_analyze_file: Option<PathBuf>,

    /// Serve identical preflight invocations from the in-run cache
    #[arg(long)]
    pub cache_preflights: bool,

    /// Honor stop_if_nonempty short-circuits
    #[arg(long)]
    pub short_circuit_preflights: bool,

    /// Raise chat top-k to the evidence row count
    #[arg(long)]
    pub adaptive_top_k: bool,

    /// Initial chat top-k before adaptation
    #[arg(long)]
    pub chat_top_k_initial: Option<u32>,

    /// Prompt composition mode
    #[arg(long, value_enum, default_value = "auto")]
    pub quote_bypass_mode: QuoteBypassMode,

    /// Force the empty-evidence gate on
    #[arg(long, conflicts_with = "no_evidence_empty_gate")]
    pub evidence_empty_gate: bool,

    /// Force the empty-evidence gate off
    #[arg(long, conflicts_with = "evidence_empty_gate")]
    pub no_evidence_empty_gate: bool,

    /// Run the pack once per replicate seed
    #[arg(long, requires = "replicate_seeds")]
    pub replicate: bool,

    /// Comma-separated seeds for replicate mode
    #[arg(long, value_name = "CSV")]
    pub replicate_seeds: Option<String>,

    /// Emit a verbose transcript of the workflow
    #[arg(long)]
    pub verbose: bool,
}

/// Check command inputs: validate configuration without running anything.
#[derive(Parser, Debug)]
#[command(about = "Validate pack, policy, and engine specs without executing")]
pub struct CheckArgs {
    /// Pack file (YAML)
    #[arg(long, value_name = "PATH")]
    pub pack: PathBuf,

    /// Engine specs file (YAML)
    #[arg(long, value_name = "PATH")]
    pub engine_specs: Option<PathBuf>,

    /// Runner policy file (YAML)
    #[arg(long, value_name = "PATH")]
    pub policy: Option<PathBuf>,

    /// Emit a verbose transcript of the workflow
    #[arg(long)]
    pub verbose: bool,
}

impl RunArgs {
    /// CLI override for the empty-evidence gate, when either flag was given.
    pub fn evidence_gate_override(&self) -> Option<bool> {
        if self.evidence_empty_gate {
            Some(true)
        } else if self.no_evidence_empty_gate {
            Some(false)
        } else {
            None
        }
    }
}

/// Parse a comma-separated seed list.
pub fn parse_seed_csv(csv: &str) -> anyhow::Result<Vec<u64>> {
    let mut seeds = Vec::new();
    for part in csv.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let seed = part
            .parse::<u64>()
            .map_err(|err| anyhow::anyhow!("invalid replicate seed {part:?}: {err}"))?;
        seeds.push(seed);
    }
    if seeds.is_empty() {
        return Err(anyhow::anyhow!("replicate seed list is empty"));
    }
    Ok(seeds)
}
