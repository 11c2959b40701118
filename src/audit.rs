//! Evidence delivery audit: reconcile evidence paths with the table.
//!
//! Every path the prompt showed the model must exist in the stored table's
//! path universe. Paths are canonicalized first (separator normalization,
//! repo-root prefix stripping, absolute-path resolution) and low-confidence
//! tokens (toolchain paths, index artifacts) are dropped rather than
//! reported as misses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::dispatch::DispatchDescriptor;
use crate::evidence::cite::extract_path_tokens;
use crate::evidence::EvidenceSet;
use crate::table::TableCatalog;

/// Per-question audit row, persisted as `<QID>_evidence_delivery_audit.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceAuditRow {
    pub qid: String,
    pub evidence_blocks_count: usize,
    pub evidence_paths: Vec<String>,
    pub paths_missing_from_parquet: Vec<String>,
    pub paths_missing_from_parquet_count: usize,
    pub llm_dispatches: Vec<DispatchDescriptor>,
}

/// Run-level summary, persisted as `EVIDENCE_DELIVERY_SUMMARY.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceDeliverySummary {
    pub schema_version: u32,
    pub questions: Vec<EvidenceAuditRow>,
    pub total_missing_paths_from_parquet: usize,
}

/// Current schema version for evidence audit artifacts.
pub const EVIDENCE_AUDIT_SCHEMA_VERSION: u32 = 1;

/// Suffixes marking index artifacts rather than repo files.
const INDEX_ARTIFACT_SUFFIXES: &[&str] = &[".parquet", ".idx", ".index", ".bin"];

/// Canonicalize one evidence path token against the audited repo root.
///
/// Returns `None` for low-confidence tokens that should be dropped from the
/// audit rather than counted as misses. Idempotent:
/// `canonicalize(canonicalize(p)) == canonicalize(p)`.
pub fn canonicalize_path(token: &str, target_dir: &Path) -> Option<String> {
    let mut path = token.replace('\\', "/");
    while let Some(stripped) = path.strip_prefix("./") {
        path = stripped.to_string();
    }
    if path.is_empty() || path.starts_with('~') {
        return None;
    }

    if INDEX_ARTIFACT_SUFFIXES
        .iter()
        .any(|suffix| path.ends_with(suffix))
    {
        return None;
    }

    let root_name = target_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string());

    if path.starts_with('/') {
        // Absolute paths must resolve under the repo root; anything else is
        // a tool or toolchain path.
        let root = target_dir.display().to_string().replace('\\', "/");
        if let Some(stripped) = path.strip_prefix(&format!("{}/", root.trim_end_matches('/'))) {
            path = stripped.to_string();
        } else if let Some(root_name) = &root_name {
            let marker = format!("/{root_name}/");
            match path.find(&marker) {
                Some(at) => path = path[at + marker.len()..].to_string(),
                None => return None,
            }
        } else {
            return None;
        }
    }

    // A redundant repo-root-name prefix is stripped so `repo/src/foo`
    // reconciles as `src/foo`.
    if let Some(root_name) = &root_name {
        if let Some(stripped) = path.strip_prefix(&format!("{root_name}/")) {
            path = stripped.to_string();
        }
    }

    if path.is_empty() {
        return None;
    }
    if !path.contains('/') && !target_dir.join(&path).exists() {
        // Single-segment literal with no file behind it.
        return None;
    }
    Some(path)
}

/// Build the audit row for one question.
pub fn audit_question(
    qid: &str,
    evidence: &EvidenceSet,
    catalog: &TableCatalog,
    target_dir: &Path,
    llm_dispatches: Vec<DispatchDescriptor>,
) -> EvidenceAuditRow {
    let mut raw_paths: BTreeSet<String> = BTreeSet::new();
    for block in &evidence.blocks {
        raw_paths.extend(block.paths.iter().cloned());
        raw_paths.extend(extract_path_tokens(&block.text));
    }

    let mut evidence_paths: Vec<String> = raw_paths
        .into_iter()
        .filter_map(|token| canonicalize_path(&token, target_dir))
        .collect();
    evidence_paths.sort();
    evidence_paths.dedup();

    let paths_missing_from_parquet: Vec<String> = evidence_paths
        .iter()
        .filter(|path| !catalog.contains_path(path))
        .cloned()
        .collect();

    if !paths_missing_from_parquet.is_empty() {
        tracing::warn!(
            qid,
            missing = paths_missing_from_parquet.len(),
            "evidence paths missing from table path universe"
        );
    }

    EvidenceAuditRow {
        qid: qid.to_string(),
        evidence_blocks_count: evidence.len(),
        evidence_paths,
        paths_missing_from_parquet_count: paths_missing_from_parquet.len(),
        paths_missing_from_parquet,
        llm_dispatches,
    }
}

/// Aggregate per-question rows into the run summary.
pub fn summarize(questions: Vec<EvidenceAuditRow>) -> EvidenceDeliverySummary {
    let total_missing_paths_from_parquet = questions
        .iter()
        .map(|row| row.paths_missing_from_parquet_count)
        .sum();
    EvidenceDeliverySummary {
        schema_version: EVIDENCE_AUDIT_SCHEMA_VERSION,
        questions,
        total_missing_paths_from_parquet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceBlock;
    use crate::pack::RenderMode;
    use std::collections::BTreeSet as PathSet;
    use std::path::PathBuf;

    fn catalog(paths: &[&str]) -> TableCatalog {
        TableCatalog {
            columns: vec!["path".to_string()],
            path_universe: paths.iter().map(|path| path.to_string()).collect::<PathSet<_>>(),
        }
    }

    fn target_dir() -> PathBuf {
        PathBuf::from("/abs/repo_name")
    }

    #[test]
    fn strips_repo_root_name_prefix() {
        assert_eq!(
            canonicalize_path("repo_name/src/b.rs", &target_dir()).as_deref(),
            Some("src/b.rs")
        );
    }

    #[test]
    fn resolves_absolute_paths_under_root() {
        assert_eq!(
            canonicalize_path("/abs/repo_name/src/c.rs", &target_dir()).as_deref(),
            Some("src/c.rs")
        );
    }

    #[test]
    fn drops_toolchain_paths() {
        assert_eq!(canonicalize_path("/usr/bin/python3", &target_dir()), None);
        assert_eq!(canonicalize_path("~/.cargo/bin/cargo", &target_dir()), None);
    }

    #[test]
    fn drops_index_artifacts() {
        assert_eq!(canonicalize_path("facts/strings.parquet", &target_dir()), None);
        assert_eq!(canonicalize_path("repo.idx", &target_dir()), None);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let inputs = ["repo_name/src/b.rs", "/abs/repo_name/src/c.rs", "./src/d.rs"];
        for input in inputs {
            let once = canonicalize_path(input, &target_dir()).unwrap();
            let twice = canonicalize_path(&once, &target_dir()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn audit_reconciles_canonicalized_paths() {
        let evidence = EvidenceSet {
            blocks: vec![EvidenceBlock {
                step: "files".to_string(),
                render_mode: RenderMode::List,
                text: "- repo_name/src/b.rs:5\n- /abs/repo_name/src/c.rs:8\n".to_string(),
                anchor: "Q1_files.json:1".to_string(),
                tokens: Vec::new(),
                paths: vec![
                    "repo_name/src/b.rs".to_string(),
                    "/abs/repo_name/src/c.rs".to_string(),
                ],
                row_count: 2,
            }],
        };
        let row = audit_question(
            "Q1",
            &evidence,
            &catalog(&["src/b.rs", "src/c.rs"]),
            &target_dir(),
            Vec::new(),
        );
        assert!(row.paths_missing_from_parquet.is_empty());
        assert_eq!(row.paths_missing_from_parquet_count, 0);
        assert_eq!(row.evidence_paths, vec!["src/b.rs", "src/c.rs"]);
    }

    #[test]
    fn missing_paths_are_counted_and_summed() {
        let evidence = EvidenceSet {
            blocks: vec![EvidenceBlock {
                step: "files".to_string(),
                render_mode: RenderMode::List,
                text: String::new(),
                anchor: "Q1_files.json:1".to_string(),
                tokens: Vec::new(),
                paths: vec!["src/ghost.rs".to_string()],
                row_count: 1,
            }],
        };
        let row = audit_question(
            "Q1",
            &evidence,
            &catalog(&["src/b.rs"]),
            &target_dir(),
            Vec::new(),
        );
        assert_eq!(row.paths_missing_from_parquet, vec!["src/ghost.rs"]);

        let summary = summarize(vec![row]);
        assert_eq!(summary.total_missing_paths_from_parquet, 1);
    }
}
