//! Declarative filter pipeline over preflight rows.
//!
//! Filters apply in a fixed order: stale-path denylist, pack excludes, pack
//! includes, test-file exclusion, comment-only exclusion, substring/regex
//! requirements, cross-step top-path narrowing, named compactors, bounds.
//! A step whose pre-filter row count clears the starvation threshold but
//! whose post-filter count is zero emits a `filtered_to_zero` diagnostic.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::contract::SchemaContract;
use crate::pack::{GroupByPathTopN, Transform};
use crate::policy::RunnerPolicy;

/// Effective filter defaults for a run: runner policy merged with the pack's
/// runner overrides.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub stale_path_denylist: Vec<String>,
    pub excludes: Vec<String>,
    pub includes: Vec<String>,
    pub test_path_patterns: Vec<String>,
    pub starvation_threshold: usize,
    pub default_max_items: usize,
    pub default_max_chars: usize,
}

impl FilterSettings {
    pub fn from_policy(policy: &RunnerPolicy, overrides: Option<&crate::pack::RunnerOverrides>) -> Self {
        let mut settings = FilterSettings {
            stale_path_denylist: policy.stale_path_denylist.clone(),
            excludes: policy.excludes.clone(),
            includes: policy.includes.clone(),
            test_path_patterns: policy.test_path_patterns.clone(),
            starvation_threshold: policy.starvation_threshold,
            default_max_items: policy.default_max_items,
            default_max_chars: policy.default_max_chars,
        };
        if let Some(overrides) = overrides {
            settings.excludes.extend(overrides.excludes.iter().cloned());
            settings.includes.extend(overrides.includes.iter().cloned());
            if let Some(threshold) = overrides.starvation_threshold {
                settings.starvation_threshold = threshold;
            }
            if let Some(max_items) = overrides.default_max_items {
                settings.default_max_items = max_items;
            }
            if let Some(max_chars) = overrides.default_max_chars {
                settings.default_max_chars = max_chars;
            }
        }
        settings
    }
}

/// Structured diagnostic recorded on the question when filtering starves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDiagnostic {
    pub kind: String,
    pub step: String,
    pub pre_filter: usize,
    pub post_filter: usize,
}

/// Result of applying the pipeline to one step's rows.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub rows: Vec<Value>,
    pub pre_filter: usize,
    pub post_filter: usize,
    pub diagnostics: Vec<FilterDiagnostic>,
}

/// Language-heuristic comment detection, kept behind a trait so packs for
/// other language families can swap the predicate.
pub trait CommentDetector {
    fn is_comment_only(&self, line: &str) -> bool;
}

/// Default detector: `//`, `#`, `--` prefixes and C-style block openers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCommentDetector;

impl CommentDetector for DefaultCommentDetector {
    fn is_comment_only(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        trimmed.starts_with("//")
            || trimmed.starts_with('#')
            || trimmed.starts_with("--")
            || trimmed.starts_with("/*")
            || trimmed.starts_with("* ")
            || trimmed.starts_with("<!--")
    }
}

/// Named pluggable compactors referenced by `filter_fn`.
pub fn filter_fn_exists(name: &str) -> bool {
    matches!(name, "doc_compact" | "dedupe_paths")
}

fn apply_filter_fn(name: &str, rows: Vec<Value>, contract: &SchemaContract) -> Vec<Value> {
    match name {
        "doc_compact" => rows
            .into_iter()
            .map(|mut row| {
                for key in &contract.snippet_keys {
                    if let Some(text) = row.get(key).and_then(Value::as_str) {
                        let compacted = compact_text(text);
                        if let Some(object) = row.as_object_mut() {
                            object.insert(key.clone(), Value::String(compacted));
                        }
                    }
                }
                row
            })
            .collect(),
        "dedupe_paths" => {
            let mut seen = std::collections::BTreeSet::new();
            rows.into_iter()
                .filter(|row| match contract.row_path(row) {
                    Some(path) => seen.insert(path),
                    None => true,
                })
                .collect()
        }
        _ => rows,
    }
}

/// Collapse runs of blank lines and trim trailing whitespace per line.
fn compact_text(text: &str) -> String {
    let mut out = Vec::new();
    let mut blank_run = false;
    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            if !blank_run {
                out.push(String::new());
            }
            blank_run = true;
        } else {
            out.push(trimmed.to_string());
            blank_run = false;
        }
    }
    out.join("\n")
}

/// Apply the full pipeline to one step's pre-filter rows.
///
/// `earlier_rows` maps earlier step names to their post-filter rows, for
/// `group_by_path_top_n` narrowing.
pub fn apply_transform(
    step_name: &str,
    rows: Vec<Value>,
    transform: Option<&Transform>,
    contract: &SchemaContract,
    settings: &FilterSettings,
    earlier_rows: &BTreeMap<String, Vec<Value>>,
) -> Result<TransformOutcome> {
    let pre_filter = rows.len();
    let detector = DefaultCommentDetector;
    let empty = Transform::default();
    let transform = transform.unwrap_or(&empty);

    let mut kept: Vec<Value> = rows;

    // 1. Default stale-path excludes.
    kept.retain(|row| {
        contract.row_path(row).is_none_or(|path| {
            !settings
                .stale_path_denylist
                .iter()
                .any(|pattern| path.contains(pattern.as_str()))
        })
    });

    // 2. Pack excludes (runner defaults plus per-step).
    let excludes: Vec<&String> = settings.excludes.iter().chain(&transform.excludes).collect();
    if !excludes.is_empty() {
        kept.retain(|row| {
            contract
                .row_path(row)
                .is_none_or(|path| !excludes.iter().any(|pattern| path.contains(pattern.as_str())))
        });
    }

    // 3. Includes: when non-empty, rows not matching any include are dropped.
    let includes: Vec<&String> = settings.includes.iter().chain(&transform.includes).collect();
    if !includes.is_empty() {
        kept.retain(|row| {
            contract
                .row_path(row)
                .is_some_and(|path| includes.iter().any(|pattern| path.contains(pattern.as_str())))
        });
    }

    // 4. Test-file exclusion.
    if transform.exclude_test_files {
        let patterns: Vec<&String> = settings
            .test_path_patterns
            .iter()
            .chain(&transform.test_path_patterns)
            .collect();
        let compiled: Vec<Regex> = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("compile test path pattern {pattern:?}"))
            })
            .collect::<Result<_>>()?;
        kept.retain(|row| {
            contract
                .row_path(row)
                .is_none_or(|path| !compiled.iter().any(|regex| regex.is_match(&path)))
        });
    }

    // 5. Comment-only line exclusion.
    if transform.exclude_comments {
        kept.retain(|row| {
            contract
                .row_snippet(row)
                .is_none_or(|snippet| !detector.is_comment_only(&snippet))
        });
    }

    // 6. Substring and regex requirements over path + line text.
    if !transform.require_contains.is_empty() {
        kept.retain(|row| {
            let haystack = row_haystack(row, contract);
            transform
                .require_contains
                .iter()
                .all(|needle| haystack.contains(needle.as_str()))
        });
    }
    if !transform.require_regex.is_empty() {
        let compiled: Vec<Regex> = transform
            .require_regex
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("compile require_regex {pattern:?}"))
            })
            .collect::<Result<_>>()?;
        kept.retain(|row| {
            let haystack = row_haystack(row, contract);
            compiled.iter().all(|regex| regex.is_match(&haystack))
        });
    }

    // 7. Cross-step top-path narrowing.
    if let Some(group) = &transform.group_by_path_top_n {
        kept = narrow_to_top_paths(kept, group, contract, earlier_rows);
    }

    // 8. Named compactors.
    if let Some(name) = &transform.filter_fn {
        kept = apply_filter_fn(name, kept, contract);
    }

    // 9. Row-count bound. The char bound applies at render time.
    let max_items = transform.max_items.unwrap_or(settings.default_max_items);
    if max_items > 0 && kept.len() > max_items {
        kept.truncate(max_items);
    }

    let post_filter = kept.len();
    let mut diagnostics = Vec::new();
    if pre_filter >= settings.starvation_threshold && post_filter == 0 && pre_filter > 0 {
        tracing::warn!(
            step = step_name,
            pre_filter,
            post_filter,
            "filtered_to_zero"
        );
        diagnostics.push(FilterDiagnostic {
            kind: "filtered_to_zero".to_string(),
            step: step_name.to_string(),
            pre_filter,
            post_filter,
        });
    }

    Ok(TransformOutcome {
        rows: kept,
        pre_filter,
        post_filter,
        diagnostics,
    })
}

/// The match target for `require_*` filters: path plus extracted line text.
fn row_haystack(row: &Value, contract: &SchemaContract) -> String {
    let mut haystack = contract.row_path(row).unwrap_or_default();
    if let Some(snippet) = contract.row_snippet(row) {
        haystack.push(' ');
        haystack.push_str(&snippet);
    }
    if haystack.trim().is_empty() {
        // Rows without semantic keys still get matched on their raw form.
        haystack = row.to_string();
    }
    haystack
}

fn narrow_to_top_paths(
    rows: Vec<Value>,
    group: &GroupByPathTopN,
    contract: &SchemaContract,
    earlier_rows: &BTreeMap<String, Vec<Value>>,
) -> Vec<Value> {
    let Some(reference_rows) = earlier_rows.get(&group.step) else {
        return Vec::new();
    };

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for row in reference_rows {
        let Some(path) = contract.row_path(row) else {
            continue;
        };
        let count = row.get(&group.count_key).and_then(Value::as_u64).unwrap_or(1);
        *counts.entry(path).or_insert(0) += count;
    }

    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    // Highest count first; ties break on path order for determinism.
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top_paths: Vec<String> = ranked
        .into_iter()
        .take(group.n)
        .map(|(path, _)| path)
        .collect();

    let mut per_path: BTreeMap<String, usize> = BTreeMap::new();
    rows.into_iter()
        .filter(|row| {
            let Some(path) = contract.row_path(row) else {
                return false;
            };
            if !top_paths.contains(&path) {
                return false;
            }
            let seen = per_path.entry(path).or_insert(0);
            *seen += 1;
            *seen <= group.per_path_cap
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractSource, SchemaContract};
    use serde_json::json;

    fn contract() -> SchemaContract {
        SchemaContract {
            path_keys: vec!["path".to_string()],
            line_keys: vec!["line".to_string()],
            snippet_keys: vec!["snippet".to_string()],
            source: ContractSource::ObservedKeys,
        }
    }

    fn settings() -> FilterSettings {
        FilterSettings {
            stale_path_denylist: vec!["audit_runs/".to_string()],
            excludes: Vec::new(),
            includes: Vec::new(),
            test_path_patterns: vec![r"(^|/)tests?/".to_string()],
            starvation_threshold: 20,
            default_max_items: 40,
            default_max_chars: 6000,
        }
    }

    fn run(
        rows: Vec<Value>,
        transform: Option<&Transform>,
        earlier: &BTreeMap<String, Vec<Value>>,
    ) -> TransformOutcome {
        apply_transform("step", rows, transform, &contract(), &settings(), earlier).unwrap()
    }

    #[test]
    fn stale_paths_are_always_dropped() {
        let rows = vec![
            json!({"path": "audit_runs/old/evidence.json"}),
            json!({"path": "src/a.rs"}),
        ];
        let outcome = run(rows, None, &BTreeMap::new());
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.pre_filter, 2);
    }

    #[test]
    fn includes_drop_non_matching_rows() {
        let transform = Transform {
            includes: vec!["src/".to_string()],
            ..Transform::default()
        };
        let rows = vec![json!({"path": "src/a.rs"}), json!({"path": "docs/b.md"})];
        let outcome = run(rows, Some(&transform), &BTreeMap::new());
        assert_eq!(outcome.rows.len(), 1);
    }

    #[test]
    fn test_files_are_excluded_by_pattern() {
        let transform = Transform {
            exclude_test_files: true,
            ..Transform::default()
        };
        let rows = vec![
            json!({"path": "tests/it.rs"}),
            json!({"path": "src/tests/unit.rs"}),
            json!({"path": "src/lib.rs"}),
        ];
        let outcome = run(rows, Some(&transform), &BTreeMap::new());
        assert_eq!(outcome.rows.len(), 1);
    }

    #[test]
    fn comment_only_rows_are_excluded() {
        let transform = Transform {
            exclude_comments: true,
            ..Transform::default()
        };
        let rows = vec![
            json!({"path": "src/a.rs", "snippet": "// only a comment"}),
            json!({"path": "src/a.rs", "snippet": "let x = 1; // trailing ok"}),
            json!({"path": "src/b.py", "snippet": "# python comment"}),
        ];
        let outcome = run(rows, Some(&transform), &BTreeMap::new());
        assert_eq!(outcome.rows.len(), 1);
    }

    #[test]
    fn require_regex_matches_path_and_text_union() {
        let transform = Transform {
            require_regex: vec!["unsafe".to_string()],
            ..Transform::default()
        };
        let rows = vec![
            json!({"path": "src/unsafe_io.rs", "snippet": "fn read() {}"}),
            json!({"path": "src/a.rs", "snippet": "unsafe { ptr.read() }"}),
            json!({"path": "src/b.rs", "snippet": "fn safe() {}"}),
        ];
        let outcome = run(rows, Some(&transform), &BTreeMap::new());
        assert_eq!(outcome.rows.len(), 2);
    }

    #[test]
    fn starvation_emits_filtered_to_zero() {
        let transform = Transform {
            require_contains: vec!["nothing-matches-this".to_string()],
            ..Transform::default()
        };
        let rows: Vec<Value> = (0..25)
            .map(|index| json!({"path": format!("src/f{index}.rs"), "snippet": "code"}))
            .collect();
        let outcome = run(rows, Some(&transform), &BTreeMap::new());
        assert_eq!(outcome.post_filter, 0);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].kind, "filtered_to_zero");
        assert_eq!(outcome.diagnostics[0].pre_filter, 25);
    }

    #[test]
    fn small_prefilter_counts_do_not_starve() {
        let transform = Transform {
            require_contains: vec!["absent".to_string()],
            ..Transform::default()
        };
        let rows = vec![json!({"path": "src/a.rs", "snippet": "code"})];
        let outcome = run(rows, Some(&transform), &BTreeMap::new());
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn group_by_path_narrows_to_top_paths_with_caps() {
        let transform = Transform {
            group_by_path_top_n: Some(GroupByPathTopN {
                step: "counts".to_string(),
                count_key: "count".to_string(),
                n: 1,
                per_path_cap: 2,
            }),
            ..Transform::default()
        };
        let mut earlier = BTreeMap::new();
        earlier.insert(
            "counts".to_string(),
            vec![
                json!({"path": "src/hot.rs", "count": 9}),
                json!({"path": "src/cold.rs", "count": 1}),
            ],
        );
        let rows = vec![
            json!({"path": "src/hot.rs", "line": 1}),
            json!({"path": "src/hot.rs", "line": 2}),
            json!({"path": "src/hot.rs", "line": 3}),
            json!({"path": "src/cold.rs", "line": 1}),
        ];
        let outcome = run(rows, Some(&transform), &earlier);
        assert_eq!(outcome.rows.len(), 2);
        for row in &outcome.rows {
            assert_eq!(row["path"], "src/hot.rs");
        }
    }

    #[test]
    fn dedupe_paths_keeps_first_row_per_path() {
        let transform = Transform {
            filter_fn: Some("dedupe_paths".to_string()),
            ..Transform::default()
        };
        let rows = vec![
            json!({"path": "src/a.rs", "line": 1}),
            json!({"path": "src/a.rs", "line": 2}),
            json!({"path": "src/b.rs", "line": 1}),
        ];
        let outcome = run(rows, Some(&transform), &BTreeMap::new());
        assert_eq!(outcome.rows.len(), 2);
    }

    #[test]
    fn max_items_caps_row_count() {
        let transform = Transform {
            max_items: Some(2),
            ..Transform::default()
        };
        let rows: Vec<Value> = (0..5).map(|index| json!({"path": format!("src/f{index}.rs")})).collect();
        let outcome = run(rows, Some(&transform), &BTreeMap::new());
        assert_eq!(outcome.rows.len(), 2);
    }

    #[test]
    fn compact_text_collapses_blank_runs() {
        let text = "a  \n\n\n\nb\n";
        assert_eq!(compact_text(text), "a\n\nb");
    }
}
