//! Preflight execution: materialize, run, normalize, persist, cache.
//!
//! Every preflight command runs as a subprocess and leaves a signed artifact
//! on disk. Within a run, identical invocations (same argv and same inputs)
//! are served from the signature cache instead of re-executing.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::engines::EngineSpec;
use crate::util::signature_hex;

/// Keys that may carry the row portion of an object-shaped payload.
pub const ROW_KEYS: &[&str] = &["rows", "results", "matches", "items", "hits"];

/// Persisted result of one preflight step.
///
/// `stdout` always retains the original parsed shape. Filtered rows live in
/// `stdout_rows_filtered` (object-shaped payloads) or replace the array with
/// the original kept in `stdout_raw` (array-shaped payloads).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightArtifact {
    pub argv: Vec<String>,
    pub returncode: i32,
    pub stdout: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_rows_filtered: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_raw: Option<Value>,
    pub stderr: String,
    pub signature: String,
    pub cached: bool,
}

impl PreflightArtifact {
    /// Key under which an object-shaped payload carries its rows.
    pub fn rows_key(&self) -> Option<&'static str> {
        let Value::Object(map) = &self.stdout else {
            return None;
        };
        ROW_KEYS
            .iter()
            .find(|key| map.get(**key).is_some_and(Value::is_array))
            .copied()
    }

    /// Rows before any filtering. Failures and non-JSON output are zero rows.
    pub fn original_rows(&self) -> Vec<Value> {
        if self.returncode != 0 {
            return Vec::new();
        }
        if let Some(raw) = &self.stdout_raw {
            if let Value::Array(rows) = raw {
                return rows.clone();
            }
        }
        match &self.stdout {
            Value::Array(rows) => rows.clone(),
            Value::Object(map) => self
                .rows_key()
                .and_then(|key| map.get(key))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Rows after filtering, falling back to the original row portion.
    pub fn rows(&self) -> Vec<Value> {
        if let Some(filtered) = &self.stdout_rows_filtered {
            return filtered.clone();
        }
        self.original_rows()
    }

    /// Record filtered rows while preserving the original payload shape.
    pub fn apply_filtered_rows(&mut self, rows: Vec<Value>) {
        match &self.stdout {
            Value::Object(_) => {
                self.stdout_rows_filtered = Some(rows);
            }
            Value::Array(_) => {
                if self.stdout_raw.is_none() {
                    self.stdout_raw = Some(self.stdout.clone());
                }
                self.stdout = Value::Array(rows.clone());
                self.stdout_rows_filtered = Some(rows);
            }
            _ => {
                self.stdout_rows_filtered = Some(rows);
            }
        }
    }

    pub fn has_rows(&self) -> bool {
        !self.rows().is_empty()
    }
}

/// Inputs shared by every preflight materialization in a run.
#[derive(Debug, Clone)]
pub struct PreflightInputs {
    pub pack_path: PathBuf,
    pub parquet: PathBuf,
    pub index: Option<PathBuf>,
    pub target_dir: PathBuf,
    pub cache_enabled: bool,
    pub timeout: Option<Duration>,
}

/// In-run signature cache: signature -> artifact file already on disk.
pub type SignatureCache = BTreeMap<String, PathBuf>;

/// Substitute placeholders and inject index/table flags where required.
pub fn materialize_argv(
    engine: &EngineSpec,
    template: &[String],
    inputs: &PreflightInputs,
) -> Vec<String> {
    let parquet = inputs.parquet.display().to_string();
    let target_dir = inputs.target_dir.display().to_string();

    let mut argv = engine.invocation.clone();
    for arg in template {
        argv.push(
            arg.replace("{parquet}", &parquet)
                .replace("{target_dir}", &target_dir),
        );
    }

    let needs_index = template
        .first()
        .is_some_and(|subcommand| engine.needs_index.iter().any(|name| name == subcommand));
    if needs_index {
        if let Some(index) = &inputs.index {
            argv.push(engine.index_flag.clone());
            argv.push(index.display().to_string());
        }
        argv.push(engine.parquet_flag.clone());
        argv.push(parquet);
        if let Some(flag) = &engine.target_dir_flag {
            argv.push(flag.clone());
            argv.push(target_dir);
        }
    }
    argv
}

/// Signature binding the invocation to the run inputs.
pub fn compute_signature(argv: &[String], inputs: &PreflightInputs) -> String {
    let pack_path = inputs.pack_path.display().to_string();
    let parquet = inputs.parquet.display().to_string();
    let index = inputs
        .index
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_default();

    let mut parts: Vec<&str> = argv.iter().map(String::as_str).collect();
    parts.push(&pack_path);
    parts.push(&parquet);
    parts.push(&index);
    signature_hex(&parts)
}

/// Execute one preflight step, serving it from cache when possible.
pub fn run_step(
    engine: &EngineSpec,
    template: &[String],
    inputs: &PreflightInputs,
    out_path: &Path,
    cache: &mut SignatureCache,
) -> Result<PreflightArtifact> {
    let argv = materialize_argv(engine, template, inputs);
    let signature = compute_signature(&argv, inputs);

    if inputs.cache_enabled {
        if let Some(prior_path) = cache.get(&signature) {
            let mut artifact = load_artifact(prior_path)?;
            artifact.cached = true;
            write_artifact(out_path, &artifact)?;
            tracing::info!(
                signature = %&signature[..12],
                from = %prior_path.display(),
                "preflight served from cache"
            );
            return Ok(artifact);
        }
    }

    let started = Instant::now();
    let captured = execute(&argv, inputs.timeout)?;
    let elapsed_ms = started.elapsed().as_millis();
    tracing::info!(
        step = %argv.join(" "),
        returncode = captured.returncode,
        elapsed_ms,
        "preflight complete"
    );

    let stdout = normalize_stdout(&captured.stdout);
    let artifact = PreflightArtifact {
        argv,
        returncode: captured.returncode,
        stdout,
        stdout_rows_filtered: None,
        stdout_raw: None,
        stderr: captured.stderr,
        signature: signature.clone(),
        cached: false,
    };
    write_artifact(out_path, &artifact)?;
    if inputs.cache_enabled {
        cache.insert(signature, out_path.to_path_buf());
    }
    Ok(artifact)
}

struct CapturedOutput {
    returncode: i32,
    stdout: String,
    stderr: String,
}

fn execute(argv: &[String], timeout: Option<Duration>) -> Result<CapturedOutput> {
    let program = argv
        .first()
        .ok_or_else(|| anyhow!("preflight argv is empty"))?;

    let Some(timeout) = timeout else {
        let output = Command::new(program)
            .args(&argv[1..])
            .output()
            .with_context(|| format!("run preflight {program:?}"))?;
        return Ok(CapturedOutput {
            returncode: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    };

    let mut child = Command::new(program)
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn preflight {program:?}"))?;

    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait().context("poll preflight")?.is_some() {
            let output = child.wait_with_output().context("collect preflight output")?;
            return Ok(CapturedOutput {
                returncode: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait().ok();
            // A timeout is recorded like any other failure: non-zero return
            // code, zero rows downstream.
            return Ok(CapturedOutput {
                returncode: -1,
                stdout: String::new(),
                stderr: format!("preflight timed out after {}s", timeout.as_secs()),
            });
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// Parse stdout as JSON when it parses; otherwise keep the raw text.
fn normalize_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(stdout.to_string()))
}

pub fn load_artifact(path: &Path) -> Result<PreflightArtifact> {
    let bytes =
        fs::read(path).with_context(|| format!("read preflight artifact {}", path.display()))?;
    serde_json::from_slice(&bytes).context("parse preflight artifact JSON")
}

pub fn write_artifact(path: &Path, artifact: &PreflightArtifact) -> Result<()> {
    let json = serde_json::to_string_pretty(artifact).context("serialize preflight artifact")?;
    fs::write(path, json).with_context(|| format!("write {}", path.display()))
}
