//! Deterministic provenance repair of the answer's citations header.
//!
//! Models routinely mention a path in the body while omitting its citation.
//! When the evidence already holds a token for that path, the repairer
//! appends it to the citations header before validation. It never invents
//! tokens: only tokens present in evidence are appended.

use crate::evidence::cite::{extract_path_tokens, split_citation_list, CiteToken};
use crate::evidence::EvidenceSet;
use crate::pack::ResponseContract;

/// Result of one repair pass.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub answer: String,
    /// Tokens appended to the citations header, in append order.
    pub appended: Vec<String>,
}

impl RepairOutcome {
    pub fn changed(&self) -> bool {
        !self.appended.is_empty()
    }
}

/// Repair the answer, active only under `enforce_paths_must_be_cited`.
///
/// Idempotent: a second pass over the repaired answer appends nothing.
pub fn repair_answer(
    answer: &str,
    contract: &ResponseContract,
    evidence: &EvidenceSet,
) -> RepairOutcome {
    if !contract.enforce_paths_must_be_cited {
        return RepairOutcome {
            answer: answer.to_string(),
            appended: Vec::new(),
        };
    }

    let verdict_prefix = contract.verdict_line_prefix.as_str();
    let citations_prefix = contract.citations_line_prefix.as_str();
    let lines: Vec<&str> = answer.lines().collect();

    let verdict_index = lines
        .iter()
        .position(|line| line.trim_start().starts_with(verdict_prefix));
    let citations_index = lines
        .iter()
        .position(|line| line.trim_start().starts_with(citations_prefix));

    let existing_tokens: Vec<String> = citations_index
        .map(|index| {
            let payload = lines[index]
                .trim_start()
                .trim_start_matches(citations_prefix);
            split_citation_list(payload)
        })
        .unwrap_or_default();

    let mut covered_paths: Vec<String> = existing_tokens
        .iter()
        .filter_map(|token| CiteToken::parse(token).map(|parsed| parsed.path))
        .collect();

    // Body excludes the verdict line and every citations-prefixed line.
    let body = lines
        .iter()
        .enumerate()
        .filter(|(index, line)| {
            Some(*index) != verdict_index && !line.trim_start().starts_with(citations_prefix)
        })
        .map(|(_, line)| *line)
        .collect::<Vec<_>>()
        .join("\n");

    let token_map = evidence.token_map();
    let mut appended = Vec::new();
    for path in extract_path_tokens(&body) {
        if covered_paths.contains(&path) {
            continue;
        }
        let Some(tokens) = token_map.get(&path) else {
            continue;
        };
        let Some(token) = tokens.first() else {
            continue;
        };
        if existing_tokens.contains(token) || appended.contains(token) {
            covered_paths.push(path);
            continue;
        }
        appended.push(token.clone());
        covered_paths.push(path);
    }

    if appended.is_empty() {
        return RepairOutcome {
            answer: answer.to_string(),
            appended,
        };
    }

    // Existing tokens first, repaired tokens after.
    let mut merged = existing_tokens;
    merged.extend(appended.iter().cloned());
    let citations_line = format!("{citations_prefix}{}", merged.join(", "));

    let mut rebuilt: Vec<String> = Vec::with_capacity(lines.len() + 1);
    match citations_index {
        Some(index) => {
            for (line_index, line) in lines.iter().enumerate() {
                if line_index == index {
                    rebuilt.push(citations_line.clone());
                } else {
                    rebuilt.push((*line).to_string());
                }
            }
        }
        None => {
            // Insert immediately after the verdict header, or lead with it.
            let insert_at = verdict_index.map_or(0, |index| index + 1);
            for (line_index, line) in lines.iter().enumerate() {
                if line_index == insert_at {
                    rebuilt.push(citations_line.clone());
                }
                rebuilt.push((*line).to_string());
            }
            if insert_at >= lines.len() {
                rebuilt.push(citations_line.clone());
            }
        }
    }

    let mut answer = rebuilt.join("\n");
    if !answer.ends_with('\n') {
        answer.push('\n');
    }
    RepairOutcome { answer, appended }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceBlock;
    use crate::pack::RenderMode;

    fn evidence() -> EvidenceSet {
        EvidenceSet {
            blocks: vec![EvidenceBlock {
                step: "files".to_string(),
                render_mode: RenderMode::List,
                text: "- src/a.rs:10".to_string(),
                anchor: "R_META_1_files.json:1".to_string(),
                tokens: vec![
                    "R_META_1_files.json:1".to_string(),
                    "src/a.rs:10".to_string(),
                ],
                paths: vec!["src/a.rs".to_string()],
                row_count: 1,
            }],
        }
    }

    #[test]
    fn appends_evidence_token_for_uncited_body_path() {
        let answer = "VERDICT=TRUE_POSITIVE\nCITATIONS=R_META_1_files.json:1\nBody mentions src/a.rs.\n";
        let outcome = repair_answer(answer, &ResponseContract::default(), &evidence());
        assert_eq!(outcome.appended, vec!["src/a.rs:10"]);
        assert!(outcome
            .answer
            .contains("CITATIONS=R_META_1_files.json:1, src/a.rs:10"));
    }

    #[test]
    fn repair_is_idempotent() {
        let answer = "VERDICT=TRUE_POSITIVE\nCITATIONS=R_META_1_files.json:1\nBody mentions src/a.rs.\n";
        let once = repair_answer(answer, &ResponseContract::default(), &evidence());
        let twice = repair_answer(&once.answer, &ResponseContract::default(), &evidence());
        assert!(!twice.changed());
        assert_eq!(once.answer, twice.answer);
    }

    #[test]
    fn never_invents_tokens() {
        let answer = "VERDICT=TRUE_POSITIVE\nCITATIONS=\nBody mentions src/unknown.rs.\n";
        let outcome = repair_answer(answer, &ResponseContract::default(), &evidence());
        assert!(!outcome.changed());
    }

    #[test]
    fn inserts_citations_line_after_verdict_when_missing() {
        let answer = "VERDICT=TRUE_POSITIVE\nBody mentions src/a.rs.\n";
        let outcome = repair_answer(answer, &ResponseContract::default(), &evidence());
        let lines: Vec<&str> = outcome.answer.lines().collect();
        assert_eq!(lines[0], "VERDICT=TRUE_POSITIVE");
        assert_eq!(lines[1], "CITATIONS=src/a.rs:10");
    }

    #[test]
    fn inactive_without_paths_must_be_cited() {
        let contract = ResponseContract {
            enforce_paths_must_be_cited: false,
            ..ResponseContract::default()
        };
        let answer = "VERDICT=TRUE_POSITIVE\nBody mentions src/a.rs.\n";
        let outcome = repair_answer(answer, &contract, &evidence());
        assert!(!outcome.changed());
        assert_eq!(outcome.answer, answer);
    }

    #[test]
    fn already_cited_path_is_left_alone() {
        let answer = "VERDICT=TRUE_POSITIVE\nCITATIONS=src/a.rs:10\nBody mentions src/a.rs.\n";
        let outcome = repair_answer(answer, &ResponseContract::default(), &evidence());
        assert!(!outcome.changed());
    }
}
