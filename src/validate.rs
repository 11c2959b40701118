//! Answer validation: response schema, citation provenance, path gates.
//!
//! Three independent checks accumulate issue strings. Schema: the answer
//! must lead with a verdict from the contract enumeration and carry a
//! citations header. Provenance: every cited token must be evidence-backed
//! (verbatim, line-overlap, or the weakened path-only rule). Path gates:
//! no new paths (gate A) and every mentioned path cited (gate B, evaluated
//! after provenance repair).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::evidence::cite::{
    extract_path_tokens, judge_token, split_citation_list, CiteToken, TokenAcceptance,
};
use crate::evidence::EvidenceSet;
use crate::pack::ResponseContract;
use crate::policy::IssueCaps;
use crate::util::cap_issues;

/// Accumulated validation output for one answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub schema_issues: Vec<String>,
    pub provenance_issues: Vec<String>,
    pub path_gate_issues: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.schema_issues.is_empty()
            && self.provenance_issues.is_empty()
            && self.path_gate_issues.is_empty()
    }

    pub fn all_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        issues.extend(self.schema_issues.iter().cloned());
        issues.extend(self.provenance_issues.iter().cloned());
        issues.extend(self.path_gate_issues.iter().cloned());
        issues
    }
}

/// Header fields parsed out of an answer.
#[derive(Debug, Clone, Default)]
pub struct AnswerHeader {
    pub verdict: Option<String>,
    /// Tokens from the first citations header line only.
    pub citation_tokens: Vec<String>,
    /// Body text with the verdict line and citations-prefixed lines removed.
    pub body: String,
}

/// Split an answer into its header fields and body.
pub fn parse_answer(answer: &str, contract: &ResponseContract) -> AnswerHeader {
    let verdict_prefix = contract.verdict_line_prefix.as_str();
    let citations_prefix = contract.citations_line_prefix.as_str();

    let mut header = AnswerHeader::default();
    let mut verdict_seen = false;
    let mut citations_seen = false;
    let mut body_lines = Vec::new();

    for line in answer.lines() {
        let trimmed = line.trim_start();
        if !verdict_seen && trimmed.starts_with(verdict_prefix) {
            header.verdict = Some(trimmed.trim_start_matches(verdict_prefix).trim().to_string());
            verdict_seen = true;
            continue;
        }
        if trimmed.starts_with(citations_prefix) {
            // Only the first citations line is the header; later ones are
            // tolerated but not substituted for it.
            if !citations_seen {
                header.citation_tokens =
                    split_citation_list(trimmed.trim_start_matches(citations_prefix));
                citations_seen = true;
            }
            continue;
        }
        body_lines.push(line);
    }
    header.body = body_lines.join("\n");
    header
}

/// Validate one answer against the contract and evidence.
pub fn validate_answer(
    answer: &str,
    contract: &ResponseContract,
    evidence: &EvidenceSet,
    strict_line_overlap: bool,
    caps: &IssueCaps,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let header = parse_answer(answer, contract);

    // 1. Response schema.
    let first_line = answer.lines().find(|line| !line.trim().is_empty());
    match first_line {
        Some(line) if line.trim_start().starts_with(contract.verdict_line_prefix.as_str()) => {}
        _ => report.schema_issues.push(format!(
            "answer does not begin with a {} header",
            contract.verdict_line_prefix.trim_end_matches('=')
        )),
    }
    match &header.verdict {
        Some(verdict) if contract.verdict_values.contains(verdict) => {}
        Some(verdict) => report.schema_issues.push(format!(
            "verdict {verdict:?} is not in the contract enumeration ({})",
            contract.verdict_values.join(", ")
        )),
        None => report
            .schema_issues
            .push("missing verdict header".to_string()),
    }
    if !answer.lines().any(|line| {
        line.trim_start()
            .starts_with(contract.citations_line_prefix.as_str())
    }) {
        report
            .schema_issues
            .push("missing citations header".to_string());
    }

    let allowed_tokens = evidence.allowed_tokens();
    let allowed_paths = evidence.allowed_paths();

    // 2. Citation provenance.
    if contract.enforce_citations_from_evidence {
        for token in &header.citation_tokens {
            match judge_token(token, &allowed_tokens, strict_line_overlap) {
                TokenAcceptance::Rejected => report
                    .provenance_issues
                    .push(format!("cited token {token:?} is not present in evidence")),
                TokenAcceptance::Verbatim
                | TokenAcceptance::Overlap
                | TokenAcceptance::PathOnly => {}
            }
        }
        cap_issues(&mut report.provenance_issues, caps.sources);
    }

    // 3a. Gate A: no paths outside the evidence allow-set.
    if contract.enforce_no_new_paths {
        let mut unknown = Vec::new();
        let mut mentioned: Vec<String> = extract_path_tokens(&header.body);
        for token in &header.citation_tokens {
            if let Some(parsed) = CiteToken::parse(token) {
                if parsed.path.contains('/') && !mentioned.contains(&parsed.path) {
                    mentioned.push(parsed.path);
                }
            }
        }
        for path in mentioned {
            if !allowed_paths.contains(&path) {
                unknown.push(format!("path {path:?} does not appear in evidence"));
            }
        }
        cap_issues(&mut unknown, caps.unknown_paths);
        report.path_gate_issues.extend(unknown);
    }

    // 3b. Gate B: every body-mentioned path must be cited. Runs after the
    // provenance repairer, so surviving violations are unrepairable.
    if contract.enforce_paths_must_be_cited {
        let cited_paths: BTreeSet<String> = header
            .citation_tokens
            .iter()
            .filter_map(|token| CiteToken::parse(token).map(|parsed| parsed.path))
            .collect();
        let mut uncited = Vec::new();
        for path in extract_path_tokens(&header.body) {
            if !cited_paths.contains(&path) {
                uncited.push(format!("path {path:?} is mentioned but not cited"));
            }
        }
        cap_issues(&mut uncited, caps.uncited_paths);
        report.path_gate_issues.extend(uncited);
    }

    report
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
                anchor: "Q1_files.json:1".to_string(),
                tokens: vec!["Q1_files.json:1".to_string(), "src/a.rs:10".to_string()],
                paths: vec!["src/a.rs".to_string()],
                row_count: 1,
            }],
        }
    }

    fn validate(answer: &str) -> ValidationReport {
        validate_answer(
            answer,
            &ResponseContract::default(),
            &evidence(),
            false,
            &IssueCaps::default(),
        )
    }

    #[test]
    fn clean_answer_passes_all_gates() {
        let report = validate(
            "VERDICT=TRUE_POSITIVE\nCITATIONS=src/a.rs:10\nThe loader in src/a.rs checks inputs.\n",
        );
        assert!(report.is_clean(), "issues: {:?}", report.all_issues());
    }

    #[test]
    fn unknown_verdict_is_a_schema_issue() {
        let report = validate("VERDICT=MAYBE\nCITATIONS=src/a.rs:10\n");
        assert_eq!(report.schema_issues.len(), 1);
        assert!(report.schema_issues[0].contains("MAYBE"));
    }

    #[test]
    fn missing_citations_header_is_a_schema_issue() {
        let report = validate("VERDICT=TRUE_POSITIVE\nbody\n");
        assert!(report
            .schema_issues
            .iter()
            .any(|issue| issue.contains("citations header")));
    }

    #[test]
    fn body_before_verdict_is_a_schema_issue() {
        let report = validate("preamble\nVERDICT=TRUE_POSITIVE\nCITATIONS=src/a.rs:10\n");
        assert!(report
            .schema_issues
            .iter()
            .any(|issue| issue.contains("does not begin")));
    }

    #[test]
    fn extra_citations_lines_are_tolerated() {
        let report = validate(
            "VERDICT=TRUE_POSITIVE\nCITATIONS=src/a.rs:10\nCITATIONS=src/a.rs:10\n",
        );
        assert!(report.is_clean());
    }

    #[test]
    fn uncited_evidence_token_is_a_provenance_issue() {
        let report = validate("VERDICT=TRUE_POSITIVE\nCITATIONS=src/zzz.rs:1\n");
        assert!(report
            .provenance_issues
            .iter()
            .any(|issue| issue.contains("src/zzz.rs:1")));
    }

    #[test]
    fn range_token_accepted_by_overlap() {
        let report = validate("VERDICT=TRUE_POSITIVE\nCITATIONS=src/a.rs:5-15\n");
        assert!(report.provenance_issues.is_empty());
    }

    #[test]
    fn strict_overlap_rejects_path_only_match() {
        let report = validate_answer(
            "VERDICT=TRUE_POSITIVE\nCITATIONS=src/a.rs:99\n",
            &ResponseContract::default(),
            &evidence(),
            true,
            &IssueCaps::default(),
        );
        assert_eq!(report.provenance_issues.len(), 1);
    }

    #[test]
    fn gate_a_flags_new_paths() {
        let report = validate(
            "VERDICT=TRUE_POSITIVE\nCITATIONS=src/a.rs:10\nAlso see src/elsewhere.rs here.\n",
        );
        assert!(report
            .path_gate_issues
            .iter()
            .any(|issue| issue.contains("src/elsewhere.rs")));
    }

    #[test]
    fn gate_b_flags_mentioned_but_uncited_paths() {
        let evidence = EvidenceSet {
            blocks: vec![EvidenceBlock {
                step: "files".to_string(),
                render_mode: RenderMode::List,
                text: String::new(),
                anchor: "Q1_files.json:1".to_string(),
                tokens: vec![
                    "Q1_files.json:1".to_string(),
                    "src/a.rs:10".to_string(),
                    "src/b.rs:2".to_string(),
                ],
                paths: vec!["src/a.rs".to_string(), "src/b.rs".to_string()],
                row_count: 2,
            }],
        };
        let report = validate_answer(
            "VERDICT=TRUE_POSITIVE\nCITATIONS=src/a.rs:10\nsrc/b.rs matters too.\n",
            &ResponseContract::default(),
            &evidence,
            false,
            &IssueCaps::default(),
        );
        assert!(report
            .path_gate_issues
            .iter()
            .any(|issue| issue.contains("src/b.rs") && issue.contains("not cited")));
    }
}
