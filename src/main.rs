//! CLI entry points for the audit pack runner.
//!
//! The runner is fail-closed: contract violations, advice gate failures, and
//! evidence audit misses aggregate into exit code 2; input and configuration
//! errors exit 3; a clean run exits 0.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod advice;
mod audit;
mod cli;
mod contract;
mod dispatch;
mod engines;
mod evidence;
mod pack;
mod policy;
mod preflight;
mod prompt;
mod repair;
mod table;
mod util;
mod validate;
mod workflow;

use cli::{CheckArgs, Command, RootArgs, RunArgs};
use engines::EngineRegistry;
use pack::{load_pack, ChatParams};
use policy::load_policy;
use prompt::SystemPrompts;
use workflow::{execute_run, replicate, RunConfig};

/// Exit code for input and configuration errors.
const EXIT_INPUT_ERROR: i32 = 3;

fn main() {
    let args = RootArgs::parse();
    let verbose = match &args.command {
        Command::Run(run) => run.verbose,
        Command::Check(check) => check.verbose,
    };
    init_tracing(verbose);

    let code = match route(args) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "run failed");
            eprintln!("error: {err:#}");
            EXIT_INPUT_ERROR
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn route(args: RootArgs) -> Result<i32> {
    match args.command {
        Command::Run(run) => cmd_run(&run),
        Command::Check(check) => cmd_check(&check),
    }
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    let policy = load_policy(args.policy.as_deref())?;
    let registry = EngineRegistry::load(args.engine_specs.as_deref())?;
    let pack = load_pack(&args.pack)?;
    registry.resolve_executables(&pack.referenced_engines())?;

    if !args.parquet.is_file() {
        return Err(anyhow!("parquet file not found at {}", args.parquet.display()));
    }
    if let Some(index) = &args.index {
        if !index.exists() {
            return Err(anyhow!("index not found at {}", index.display()));
        }
    }
    if !args.target_dir.is_dir() {
        return Err(anyhow!(
            "target dir not found at {}",
            args.target_dir.display()
        ));
    }

    let system_prompts = SystemPrompts::load(
        &args.prompt_profile,
        args.system_prompt_grounding_file.as_deref(),
        args.system_prompt_analyze_file.as_deref(),
    )?;

    let cli_chat = ChatParams {
        backend: args.backend.clone(),
        model: args.model.clone(),
        top_k: None,
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        top_p: args.top_p,
        num_ctx: args.num_ctx,
    };

    let config = RunConfig {
        out_dir: resolve_out_dir(&args.out_dir)?,
        pack_path: args.pack.clone(),
        parquet: args.parquet.clone(),
        index: args.index.clone(),
        target_dir: args.target_dir.clone(),
        policy,
        cli_chat,
        system_prompts,
        quote_bypass_mode: args.quote_bypass_mode,
        evidence_empty_gate: args.evidence_gate_override(),
        cache_preflights: args.cache_preflights,
        short_circuit_preflights: args.short_circuit_preflights,
        adaptive_top_k: args.adaptive_top_k,
        chat_top_k_initial: args.chat_top_k_initial,
        seed: None,
    };

    if args.replicate {
        let csv = args
            .replicate_seeds
            .as_deref()
            .ok_or_else(|| anyhow!("--replicate requires --replicate-seeds"))?;
        let seeds = cli::parse_seed_csv(csv)?;
        return replicate::run_replicates(&config, &pack, &registry, &seeds);
    }

    let outcome = execute_run(&config, &pack, &registry)?;
    Ok(outcome.exit_code)
}

fn cmd_check(args: &CheckArgs) -> Result<i32> {
    let policy = load_policy(args.policy.as_deref())?;
    policy::validate_policy(&policy)?;
    let registry = EngineRegistry::load(args.engine_specs.as_deref())?;
    let pack = load_pack(&args.pack)?;
    for engine in pack.referenced_engines() {
        registry.get(&engine)?;
    }
    println!(
        "ok: {} question(s), engines: {}",
        pack.questions.len(),
        pack.referenced_engines().join(", ")
    );
    Ok(0)
}

/// Single-segment out-dir names land under the default base directory;
/// multi-segment or absolute paths are used as-is.
fn resolve_out_dir(out_dir: &str) -> Result<PathBuf> {
    let path = PathBuf::from(out_dir);
    if path.is_absolute() || out_dir.contains('/') || out_dir.contains('\\') {
        return Ok(path);
    }
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .context("cannot determine a base directory for --out-dir")?;
    Ok(base.join("packrun").join("runs").join(out_dir))
}
