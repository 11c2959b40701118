//! End-to-end tests driving the packrun binary with scripted fake engines.
//!
//! Each fixture builds a tempdir holding: a fake engine shell script (schema,
//! search, and chat subcommands), a catalog script standing in for the
//! table CLI, a pack file, a policy file pointing at the catalog script, and
//! a small repo tree. Tests assert on exit codes and on-disk artifacts.

#![cfg(unix)]

use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Fixture {
        let fixture = Fixture {
            dir: tempfile::tempdir().expect("create fixture dir"),
        };

        // Repo tree and table inputs.
        fs::create_dir_all(fixture.path().join("repo/src")).expect("create repo");
        fs::write(fixture.path().join("repo/src/a.rs"), "fn load() {}\n").expect("write repo file");
        fs::write(fixture.path().join("facts.parquet"), "stub").expect("write parquet stub");

        // Default preflight rows and chat responses; tests overwrite as needed.
        fixture.write_rows(
            r#"[{"path": "src/a.rs", "line": 10, "snippet": "fn load() {}"}]"#,
        );
        fixture.write_file(
            "answer.txt",
            "VERDICT=TRUE_POSITIVE\nCITATIONS=Q1_files.json:1\nBody mentions src/a.rs.\n",
        );
        fixture.write_file(
            "advice.txt",
            "ISSUE 1: Validate the loader inputs before use\n\
             RATIONALE: the loader trusts caller paths\n\
             PATCH: add a bounds check in the loader entry\n\
             TEST: feed an oversized input and expect an error\n\
             CITATIONS: src/a.rs:10\n\
             \n\
             ISSUE 2: Reject empty configuration files early\n\
             RATIONALE: empty config passes through silently\n\
             PATCH: return an error from the parse step\n\
             TEST: parse an empty file and expect a failure\n\
             CITATIONS: Q1_files.json:1\n",
        );

        fixture.write_engine_script();
        fixture.write_catalog_script(&["src/a.rs"]);
        fixture.write_file(
            "engines.yaml",
            &format!(
                "engines:\n  fake:\n    invocation: [\"/bin/sh\", \"{}\"]\n    needs_index: [\"search\", \"chat\"]\n    supports: [\"paths\", \"lines\", \"snippets\"]\n    schema_endpoint: [\"schema\"]\n",
                fixture.path().join("engine.sh").display()
            ),
        );
        fixture.write_file(
            "policy.yaml",
            &format!(
                "catalog_cmd: [\"{}\"]\n",
                fixture.path().join("catalog.sh").display()
            ),
        );
        fixture
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn out_dir(&self) -> PathBuf {
        self.path().join("out")
    }

    fn write_file(&self, name: &str, content: &str) {
        fs::write(self.path().join(name), content).expect("write fixture file");
    }

    fn write_rows(&self, rows_json: &str) {
        self.write_file("rows.json", rows_json);
    }

    fn write_executable(&self, name: &str, body: &str) {
        let path = self.path().join(name);
        fs::write(&path, body).expect("write script");
        let mut perms = fs::metadata(&path).expect("stat script").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod script");
    }

    fn write_engine_script(&self) {
        let root = self.path().display();
        self.write_executable(
            "engine.sh",
            &format!(
                r#"#!/bin/sh
cmd="$1"
case "$cmd" in
  schema)
    printf '%s' '{{"metadata": {{}}, "columns": ["path", "line", "snippet"], "semantic_hints": {{"path_keys": ["path"], "line_keys": ["line"], "snippet_keys": ["snippet"]}}}}'
    ;;
  search)
    echo run >> "{root}/search_count.txt"
    cat "{root}/rows.json"
    ;;
  chat)
    prompt=""
    prev=""
    for arg in "$@"; do
      if [ "$prev" = "--prompt-file" ]; then prompt="$arg"; fi
      prev="$arg"
    done
    case "$prompt" in
      *advice*) cat "{root}/advice.txt" ;;
      *) cat "{root}/answer.txt" ;;
    esac
    ;;
  *)
    echo "unknown subcommand $cmd" >&2
    exit 64
    ;;
esac
"#
            ),
        );
    }

    fn write_catalog_script(&self, paths: &[&str]) {
        let rows: Vec<String> = paths
            .iter()
            .map(|path| format!("{{\"path\":\"{path}\"}}"))
            .collect();
        self.write_executable(
            "catalog.sh",
            &format!(
                r#"#!/bin/sh
case "$1" in
  DESCRIBE*)
    printf '%s' '[{{"column_name":"path"}},{{"column_name":"line"}},{{"column_name":"snippet"}}]'
    ;;
  *)
    printf '%s' '[{rows}]'
    ;;
esac
"#,
                rows = rows.join(",")
            ),
        );
    }

    fn write_pack(&self, pack_yaml: &str) {
        self.write_file("pack.yaml", pack_yaml);
    }

    fn run(&self, extra_args: &[&str]) -> std::process::Output {
        let bin = env!("CARGO_BIN_EXE_packrun");
        let mut command = Command::new(bin);
        command
            .arg("run")
            .arg("--out-dir")
            .arg(self.out_dir())
            .arg("--pack")
            .arg(self.path().join("pack.yaml"))
            .arg("--parquet")
            .arg(self.path().join("facts.parquet"))
            .arg("--target-dir")
            .arg(self.path().join("repo"))
            .arg("--engine-specs")
            .arg(self.path().join("engines.yaml"))
            .arg("--policy")
            .arg(self.path().join("policy.yaml"))
            .args(extra_args);
        command.output().expect("run packrun")
    }

    fn read_json(&self, rel: &str) -> Value {
        let path = self.out_dir().join(rel);
        let bytes = fs::read(&path)
            .unwrap_or_else(|err| panic!("read {}: {err}", path.display()));
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|err| panic!("parse {}: {err}", path.display()))
    }
}

const LLM_PACK: &str = r#"
version: 1
pack_type: audit
engine: fake
questions:
  - id: Q1
    title: Loader validation
    question_text: Does the loader validate inputs?
    preflight:
      - name: files
        argv: ["search", "loader"]
"#;

const DETERMINISTIC_PACK: &str = r#"
version: 1
pack_type: audit
engine: fake
questions:
  - id: Q1
    title: Loader evidence
    question_text: Is loader evidence present?
    response_mode: deterministic
    preflight:
      - name: files
        argv: ["search", "loader"]
  - id: Q2
    title: Loader evidence again
    question_text: Is loader evidence still present?
    response_mode: deterministic
    preflight:
      - name: files
        argv: ["search", "loader"]
"#;

const MISSION_ADVICE_PACK: &str = r#"
version: 1
pack_type: mission
engine: fake
questions:
  - id: Q1
    title: Loader validation
    question_text: Does the loader validate inputs?
    advice_mode: llm
    preflight:
      - name: files
        argv: ["search", "loader"]
"#;

#[test]
fn clean_run_repairs_citations_and_exits_zero() {
    let fixture = Fixture::new();
    fixture.write_pack(LLM_PACK);

    let output = fixture.run(&[]);
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // Gate B repair: the body mentions src/a.rs, so its evidence token is
    // appended after the existing anchor citation.
    let chat = fixture.read_json("Q1_chat.json");
    let answer = chat["answer"].as_str().expect("answer text");
    assert!(
        answer.contains("CITATIONS=Q1_files.json:1, src/a.rs:10"),
        "answer: {answer}"
    );

    let manifest = fixture.read_json("RUN_MANIFEST.json");
    assert_eq!(manifest["exit_code"], 0);
    assert_eq!(manifest["questions"][0]["verdict"], "TRUE_POSITIVE");
    assert_eq!(manifest["fatal_contract_issues"].as_array().map(Vec::len), Some(0));

    let summary = fixture.read_json("EVIDENCE_DELIVERY_SUMMARY.json");
    assert_eq!(summary["total_missing_paths_from_parquet"], 0);

    // Auto mode with evidence selects quote-bypass composition.
    assert!(fixture.out_dir().join("Q1_bypass_prompt.md").is_file());
    assert!(!fixture.out_dir().join("Q1_augmented_prompt.md").exists());
}

#[test]
fn empty_evidence_strict_mode_aborts_without_dispatch() {
    let fixture = Fixture::new();
    fixture.write_rows("[]");
    fixture.write_pack(LLM_PACK);

    let output = fixture.run(&[]);
    assert_eq!(output.status.code(), Some(2));

    // No LLM dispatch happened for the gated question.
    assert!(!fixture.out_dir().join("Q1_chat.json").exists());

    let manifest = fixture.read_json("RUN_MANIFEST.json");
    let fatals = manifest["fatal_contract_issues"].as_array().expect("fatals");
    assert_eq!(fatals.len(), 1);
    assert!(fatals[0].as_str().expect("issue").contains("Q1"));
}

#[test]
fn gate_can_be_disabled_from_the_cli() {
    let fixture = Fixture::new();
    fixture.write_rows("[]");
    fixture.write_file("answer.txt", "VERDICT=NEEDS_REVIEW\nCITATIONS=\nNothing found.\n");
    fixture.write_pack(LLM_PACK);

    let output = fixture.run(&["--no-evidence-empty-gate"]);
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // With no evidence, auto mode composes the grounding prompt.
    assert!(fixture.out_dir().join("Q1_augmented_prompt.md").is_file());
    assert!(fixture.out_dir().join("Q1_chat.json").is_file());
}

#[test]
fn preflight_cache_serves_identical_invocations_once() {
    let fixture = Fixture::new();
    fixture.write_pack(DETERMINISTIC_PACK);

    let output = fixture.run(&["--cache-preflights"]);
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // The engine executed once; the second question hit the cache.
    let count = fs::read_to_string(fixture.path().join("search_count.txt")).expect("count file");
    assert_eq!(count.lines().count(), 1);

    let first = fixture.read_json("Q1_files.json");
    let second = fixture.read_json("Q2_files.json");
    assert_eq!(first["cached"], false);
    assert_eq!(second["cached"], true);
    assert_eq!(first["stdout"], second["stdout"]);
    assert_eq!(first["signature"], second["signature"]);

    // Deterministic questions never dispatch.
    let audit = fixture.read_json("Q1_evidence_delivery_audit.json");
    assert_eq!(audit["llm_dispatches"].as_array().map(Vec::len), Some(0));
}

#[test]
fn shape_preserving_filter_keeps_summary_keys() {
    let fixture = Fixture::new();
    fixture.write_rows(
        r#"{"summary": {"grade": "B"}, "rows": [
            {"path": "src/a.rs", "line": 10, "snippet": "fn load() {}"},
            {"path": "tests/it.rs", "line": 1, "snippet": "fn t() {}"},
            {"path": "src/a.rs", "line": 99, "snippet": "// comment only"}
        ]}"#,
    );
    fixture.write_pack(
        r#"
version: 1
pack_type: audit
engine: fake
questions:
  - id: Q1
    title: Filtered evidence
    question_text: Is the filtered evidence well formed?
    response_mode: deterministic
    preflight:
      - name: files
        argv: ["search", "loader"]
        transform:
          exclude_test_files: true
          exclude_comments: true
"#,
    );

    let output = fixture.run(&[]);
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let artifact = fixture.read_json("Q1_files.json");
    // Original dict shape survives filtering; rows land in the sibling field.
    assert!(artifact["stdout"]["summary"].is_object());
    assert_eq!(
        artifact["stdout"]["rows"].as_array().map(Vec::len),
        Some(3)
    );
    assert_eq!(
        artifact["stdout_rows_filtered"].as_array().map(Vec::len),
        Some(1)
    );
}

#[test]
fn mission_advice_pass_records_dispatch_phases() {
    let fixture = Fixture::new();
    fixture.write_pack(MISSION_ADVICE_PACK);

    let output = fixture.run(&[]);
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    assert!(fixture.out_dir().join("Q1_advice_prompt.md").is_file());
    assert!(fixture.out_dir().join("Q1_advice_chat.json").is_file());

    let audit = fixture.read_json("Q1_evidence_delivery_audit.json");
    let phases: Vec<&str> = audit["llm_dispatches"]
        .as_array()
        .expect("dispatches")
        .iter()
        .filter_map(|descriptor| descriptor["phase"].as_str())
        .collect();
    assert_eq!(phases, vec!["chat", "advice"]);

    let manifest = fixture.read_json("RUN_MANIFEST.json");
    assert_eq!(manifest["questions"][0]["advice_validated"], true);
}

#[test]
fn evidence_path_missing_from_table_is_fatal() {
    let fixture = Fixture::new();
    // The table only knows src/other.rs, so src/a.rs is a delivery miss.
    fixture.write_catalog_script(&["src/other.rs"]);
    fixture.write_pack(DETERMINISTIC_PACK);

    let output = fixture.run(&[]);
    assert_eq!(output.status.code(), Some(2));

    let summary = fixture.read_json("EVIDENCE_DELIVERY_SUMMARY.json");
    assert!(summary["total_missing_paths_from_parquet"].as_u64() > Some(0));

    let manifest = fixture.read_json("RUN_MANIFEST.json");
    let fatals = manifest["fatal_contract_issues"].as_array().expect("fatals");
    assert!(fatals
        .iter()
        .any(|issue| issue.as_str().is_some_and(|text| text.contains("evidence audit"))));
}

#[test]
fn replicate_mode_writes_per_seed_runs_and_stability_summary() {
    let fixture = Fixture::new();
    fixture.write_pack(DETERMINISTIC_PACK);

    let output = fixture.run(&["--replicate", "--replicate-seeds", "1,2"]);
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    assert!(fixture.out_dir().join("seed_1/RUN_MANIFEST.json").is_file());
    assert!(fixture.out_dir().join("seed_2/RUN_MANIFEST.json").is_file());

    let summary = fs::read_to_string(fixture.out_dir().join("STABILITY_SUMMARY.md"))
        .expect("stability summary");
    assert!(summary.contains("unstable questions: 0"));
    assert!(summary.contains("| Q1 |"));
}

#[test]
fn invalid_pack_regex_exits_with_input_error() {
    let fixture = Fixture::new();
    fixture.write_pack(
        r#"
version: 1
pack_type: audit
engine: fake
questions:
  - id: Q1
    title: Bad regex
    question_text: q
    preflight:
      - name: files
        argv: ["search", "loader"]
        transform:
          require_regex: ["[unclosed"]
"#,
    );

    let output = fixture.run(&[]);
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("compile"), "stderr: {stderr}");
}

#[test]
fn check_subcommand_validates_without_executing() {
    let fixture = Fixture::new();
    fixture.write_pack(LLM_PACK);

    let bin = env!("CARGO_BIN_EXE_packrun");
    let output = Command::new(bin)
        .arg("check")
        .arg("--pack")
        .arg(fixture.path().join("pack.yaml"))
        .arg("--engine-specs")
        .arg(fixture.path().join("engines.yaml"))
        .arg("--policy")
        .arg(fixture.path().join("policy.yaml"))
        .output()
        .expect("run check");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 question(s)"));

    // Check never ran the engine.
    assert!(!fixture.path().join("search_count.txt").exists());
}
