//! Corrective-advice pass: prompt, quality gate, bounded retries.
//!
//! Advice runs under the grounding-style system prompt so the answer header
//! contract is not imposed on the advice output. The quality gate rejects
//! praise, under-filled issue blocks, and citations that are not backed by
//! evidence; mission-grade packs retry with a repair prompt enumerating the
//! specific failures.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::evidence::cite::{judge_token, split_citation_list, TokenAcceptance};
use crate::evidence::EvidenceSet;
use crate::pack::Question;
use crate::policy::{AdviceQualityGate, AdviceRetry, AdviceRetryMode};

/// Outcome of the advice pass for one question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdviceResult {
    pub advice: Option<String>,
    /// Dispatch count, retries included.
    pub attempts: usize,
    /// Quality issues from the final attempt; empty when validation passed.
    pub quality_issues: Vec<String>,
    pub validated: bool,
}

/// One parsed numbered issue block.
#[derive(Debug, Clone)]
struct IssueBlock {
    number: usize,
    statement: String,
    body: String,
}

/// Build the advice prompt for the first attempt.
pub fn build_advice_prompt(
    question: &Question,
    answer: &str,
    evidence: &EvidenceSet,
    gate: &AdviceQualityGate,
    template_notes: &[String],
) -> String {
    if let Some(override_text) = &question.advice_prompt_override {
        return override_text.clone();
    }

    let mut prompt = String::new();
    prompt.push_str(&format!(
        "You are reviewing the audit finding below for `{}` and must propose \
         concrete corrective work.\n\n",
        question.id
    ));

    prompt.push_str("# Question\n\n");
    prompt.push_str(question.question_text.trim());
    prompt.push_str("\n\n# Finding\n\n");
    prompt.push_str(answer.trim());
    prompt.push_str("\n\n# Evidence\n\n");
    for block in &evidence.blocks {
        prompt.push_str(&format!("## step: {}\nCITE={}\n\n", block.step, block.anchor));
        prompt.push_str(block.text.trim_end());
        prompt.push_str("\n\n");
    }

    prompt.push_str("# Required format\n\n");
    prompt.push_str(&format!(
        "List at least {} numbered issues. Each issue must follow this exact template:\n\n",
        gate.min_issues
    ));
    prompt.push_str("ISSUE <n>: <imperative statement of what to change>\n");
    for field in &gate.required_fields {
        let hint = match field.as_str() {
            "RATIONALE" => "why this matters, grounded in the evidence",
            "PATCH" => "a concrete sketch of the change",
            "TEST" => "how to verify the change",
            "CITATIONS" => "evidence tokens backing this issue",
            _ => "required detail",
        };
        prompt.push_str(&format!("{field}: <{hint}>\n"));
    }
    prompt.push('\n');
    prompt.push_str(
        "Start each issue statement with an imperative verb. Do not praise the \
         code; every issue must demand a change. Cite only tokens from the \
         evidence above.\n",
    );
    for note in template_notes {
        prompt.push_str(note);
        prompt.push('\n');
    }
    prompt
}

/// Build the retry prompt enumerating the previous attempt's failures.
pub fn build_repair_prompt(original_prompt: &str, previous_advice: &str, issues: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Your previous advice response failed validation. Fix every problem \
         listed below and resend the complete advice in the required format.\n\n",
    );
    prompt.push_str("# Validation failures\n\n");
    for issue in issues {
        prompt.push_str(&format!("- {issue}\n"));
    }
    prompt.push_str("\n# Your previous response\n\n");
    prompt.push_str(previous_advice.trim());
    prompt.push_str("\n\n# Original task\n\n");
    prompt.push_str(original_prompt);
    prompt
}

fn parse_issue_blocks(advice: &str) -> Vec<IssueBlock> {
    let issue_re = Regex::new(r"(?m)^ISSUE\s+(\d+)\s*:\s*(.*)$").unwrap();
    let matches: Vec<(usize, usize, usize, String)> = issue_re
        .captures_iter(advice)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let number = captures.get(1)?.as_str().parse().ok()?;
            let statement = captures.get(2)?.as_str().trim().to_string();
            Some((whole.start(), whole.end(), number, statement))
        })
        .collect();

    let mut blocks = Vec::new();
    for (index, (_, end, number, statement)) in matches.iter().enumerate() {
        let body_end = matches
            .get(index + 1)
            .map_or(advice.len(), |(next_start, ..)| *next_start);
        blocks.push(IssueBlock {
            number: *number,
            statement: statement.clone(),
            body: advice[*end..body_end].to_string(),
        });
    }
    blocks
}

/// Validate advice text against the quality gate. Returns issue strings.
pub fn validate_advice(
    advice: &str,
    evidence: &EvidenceSet,
    gate: &AdviceQualityGate,
    strict_line_overlap: bool,
) -> Vec<String> {
    let mut issues = Vec::new();
    let blocks = parse_issue_blocks(advice);

    let has_evidence = !evidence.is_empty();
    if has_evidence && blocks.len() < gate.min_issues {
        issues.push(format!(
            "advice contains {} issue block(s); at least {} required",
            blocks.len(),
            gate.min_issues
        ));
    }
    if blocks.is_empty() {
        issues.push("advice contains no numbered ISSUE blocks".to_string());
        return issues;
    }

    let anti_praise: Vec<Regex> = gate
        .anti_praise_regex
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect();
    let imperative = Regex::new(&gate.imperative_verb_regex).ok();
    let allowed_tokens = evidence.allowed_tokens();

    for block in &blocks {
        if block.statement.is_empty() {
            issues.push(format!("ISSUE {} has an empty statement", block.number));
        } else if let Some(imperative) = &imperative {
            if !imperative.is_match(&block.statement) {
                issues.push(format!(
                    "ISSUE {} statement does not start with an imperative verb",
                    block.number
                ));
            }
        }

        let full_block = format!("{}\n{}", block.statement, block.body);
        for pattern in &anti_praise {
            if pattern.is_match(&full_block) {
                issues.push(format!(
                    "ISSUE {} contains praise-only content matching {:?}",
                    block.number,
                    pattern.as_str()
                ));
            }
        }

        for field in &gate.required_fields {
            let marker = format!("{field}:");
            if !block.body.lines().any(|line| line.trim_start().starts_with(&marker)) {
                issues.push(format!("ISSUE {} is missing field {field}", block.number));
            }
        }

        for line in block.body.lines() {
            let trimmed = line.trim_start();
            let Some(payload) = trimmed.strip_prefix("CITATIONS:") else {
                continue;
            };
            for token in split_citation_list(payload) {
                if judge_token(&token, &allowed_tokens, strict_line_overlap)
                    == TokenAcceptance::Rejected
                {
                    issues.push(format!(
                        "ISSUE {} cites {token:?} which is not backed by evidence",
                        block.number
                    ));
                }
            }
        }
    }
    issues
}

/// Run the advice pass with bounded retries.
///
/// `dispatch_fn` is called with a phase name (`advice`, `advice_retry_1`, …)
/// and a prompt, returning the advice text. Mission mode retries on
/// validation failure; otherwise a failed validation is recorded as-is.
pub fn run_advice<F>(
    question: &Question,
    answer: &str,
    evidence: &EvidenceSet,
    gate: &AdviceQualityGate,
    retry: &AdviceRetry,
    template_notes: &[String],
    strict_line_overlap: bool,
    mission: bool,
    mut dispatch_fn: F,
) -> Result<AdviceResult>
where
    F: FnMut(&str, &str) -> Result<String>,
{
    let base_prompt = build_advice_prompt(question, answer, evidence, gate, template_notes);

    let mut advice = dispatch_fn("advice", &base_prompt)?;
    let mut attempts = 1;
    let mut quality_issues = validate_advice(&advice, evidence, gate, strict_line_overlap);

    let retry_allowed = mission && retry.on_validation_fail == AdviceRetryMode::Retry;
    while !quality_issues.is_empty() && retry_allowed && attempts <= retry.attempts {
        let phase = format!("advice_retry_{attempts}");
        tracing::warn!(
            qid = %question.id,
            attempt = attempts,
            issues = quality_issues.len(),
            "advice validation failed; retrying"
        );
        let repair_prompt = build_repair_prompt(&base_prompt, &advice, &quality_issues);
        advice = dispatch_fn(&phase, &repair_prompt)?;
        attempts += 1;
        quality_issues = validate_advice(&advice, evidence, gate, strict_line_overlap);
    }

    let validated = quality_issues.is_empty();
    if !validated && !mission {
        tracing::warn!(
            qid = %question.id,
            issues = quality_issues.len(),
            "advice failed validation (non-mission pack; not fatal)"
        );
    }
    Ok(AdviceResult {
        advice: Some(advice),
        attempts,
        quality_issues,
        validated,
    })
}
