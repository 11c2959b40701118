//! Prompt composition for the two LLM modes.
//!
//! Grounding mode tells the model to answer only from cited sources and to
//! say NOT FOUND when evidence is missing. Quote-bypass mode treats the
//! injected evidence as authoritative: NOT FOUND is forbidden and the model
//! marks INSUFFICIENT EVIDENCE instead.

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::fs;
use std::path::Path;

use crate::evidence::EvidenceSet;
use crate::pack::{Question, ResponseContract};

/// Runtime policy selecting the composition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QuoteBypassMode {
    /// Quote-bypass iff at least one evidence block was produced.
    Auto,
    On,
    Off,
}

/// The style actually used for one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    Grounding,
    QuoteBypass,
}

impl PromptStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptStyle::Grounding => "grounding",
            PromptStyle::QuoteBypass => "quote_bypass",
        }
    }

    /// Filename suffix for the persisted prompt artifact.
    pub fn prompt_filename(self, qid: &str) -> String {
        match self {
            PromptStyle::Grounding => format!("{qid}_augmented_prompt.md"),
            PromptStyle::QuoteBypass => format!("{qid}_bypass_prompt.md"),
        }
    }
}

const GROUNDING_SYSTEM_PROMPT: &str = "\
You are an audit assistant answering questions about a source repository.
Use only the cited evidence provided in the prompt. Every claim must be
backed by a citation token. If the evidence does not answer the question,
respond with NOT FOUND.";

const QUOTE_BYPASS_SYSTEM_PROMPT: &str = "\
You are an audit assistant answering questions about a source repository.
The evidence quoted in the prompt is authoritative and sufficient grounds
for an answer; do not respond with NOT FOUND. If the evidence is incomplete
for part of the question, mark that part INSUFFICIENT EVIDENCE and answer
what the evidence supports.";

/// System prompt text for each style, with optional file overrides.
#[derive(Debug, Clone)]
pub struct SystemPrompts {
    pub grounding: String,
    pub analyze: String,
}

const TERSE_GROUNDING_SYSTEM_PROMPT: &str = "\
Answer from the cited evidence only. No evidence, answer NOT FOUND.";

const TERSE_QUOTE_BYPASS_SYSTEM_PROMPT: &str = "\
The quoted evidence is authoritative. Never answer NOT FOUND; mark gaps
INSUFFICIENT EVIDENCE.";

impl SystemPrompts {
    /// Resolve prompts from a named profile, with per-file overrides.
    pub fn load(
        profile: &str,
        grounding_file: Option<&Path>,
        analyze_file: Option<&Path>,
    ) -> Result<SystemPrompts> {
        let (default_grounding, default_analyze) = match profile {
            "default" => (GROUNDING_SYSTEM_PROMPT, QUOTE_BYPASS_SYSTEM_PROMPT),
            "terse" => (TERSE_GROUNDING_SYSTEM_PROMPT, TERSE_QUOTE_BYPASS_SYSTEM_PROMPT),
            other => {
                return Err(anyhow::anyhow!(
                    "unknown prompt profile {other:?} (known: default, terse)"
                ))
            }
        };
        let grounding = match grounding_file {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("read grounding system prompt {}", path.display()))?,
            None => default_grounding.to_string(),
        };
        let analyze = match analyze_file {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("read analyze system prompt {}", path.display()))?,
            None => default_analyze.to_string(),
        };
        Ok(SystemPrompts { grounding, analyze })
    }

    pub fn for_style(&self, style: PromptStyle) -> &str {
        match style {
            PromptStyle::Grounding => &self.grounding,
            PromptStyle::QuoteBypass => &self.analyze,
        }
    }
}

/// A composed prompt ready for dispatch.
#[derive(Debug, Clone)]
pub struct ComposedPrompt {
    pub style: PromptStyle,
    pub text: String,
}

/// Select the composition style for a question.
///
/// "Evidence is empty" is decided solely by the block count, independent of
/// the mode selected here.
pub fn select_style(mode: QuoteBypassMode, evidence: &EvidenceSet) -> PromptStyle {
    match mode {
        QuoteBypassMode::On => PromptStyle::QuoteBypass,
        QuoteBypassMode::Off => PromptStyle::Grounding,
        QuoteBypassMode::Auto => {
            if evidence.is_empty() {
                PromptStyle::Grounding
            } else {
                PromptStyle::QuoteBypass
            }
        }
    }
}

/// Build the augmented prompt for one question.
pub fn compose(
    question: &Question,
    contract: &ResponseContract,
    evidence: &EvidenceSet,
    style: PromptStyle,
) -> ComposedPrompt {
    let mut out = String::new();

    out.push_str("# Question\n\n");
    out.push_str(&format!("{} - {}\n\n", question.id, question.title));
    out.push_str(question.question_text.trim());
    out.push_str("\n\n");

    out.push_str("# Response contract\n\n");
    out.push_str(&contract.render_text());
    out.push('\n');

    out.push_str("# Evidence\n\n");
    if evidence.is_empty() {
        out.push_str("(no evidence blocks were produced)\n\n");
    }
    for block in &evidence.blocks {
        out.push_str(&format!("## step: {}\n", block.step));
        out.push_str(&format!("CITE={}\n\n", block.anchor));
        out.push_str(block.text.trim_end());
        out.push_str("\n\n");
    }

    out.push_str("# Available citation anchors\n\n");
    for token in evidence.allowed_tokens() {
        out.push_str(&format!("- {token}\n"));
    }

    ComposedPrompt { style, text: out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceBlock;
    use crate::pack::RenderMode;

    fn question() -> Question {
        Question {
            id: "Q1".to_string(),
            title: "Loader validation".to_string(),
            category: None,
            question_text: "Does the loader validate inputs?".to_string(),
            preflight: Vec::new(),
            chat: None,
            response_mode: crate::pack::ResponseMode::Llm,
            advice_mode: crate::pack::AdviceMode::None,
            expected_verdict: None,
            advice_prompt_override: None,
        }
    }

    fn evidence_with_block() -> EvidenceSet {
        EvidenceSet {
            blocks: vec![EvidenceBlock {
                step: "files".to_string(),
                render_mode: RenderMode::List,
                text: "- src/a.rs:10 - fn load()".to_string(),
                anchor: "Q1_files.json:1".to_string(),
                tokens: vec!["Q1_files.json:1".to_string(), "src/a.rs:10".to_string()],
                paths: vec!["src/a.rs".to_string()],
                row_count: 1,
            }],
        }
    }

    #[test]
    fn auto_mode_depends_only_on_block_count() {
        assert_eq!(
            select_style(QuoteBypassMode::Auto, &EvidenceSet::default()),
            PromptStyle::Grounding
        );
        assert_eq!(
            select_style(QuoteBypassMode::Auto, &evidence_with_block()),
            PromptStyle::QuoteBypass
        );
    }

    #[test]
    fn forced_modes_ignore_evidence() {
        assert_eq!(
            select_style(QuoteBypassMode::On, &EvidenceSet::default()),
            PromptStyle::QuoteBypass
        );
        assert_eq!(
            select_style(QuoteBypassMode::Off, &evidence_with_block()),
            PromptStyle::Grounding
        );
    }

    #[test]
    fn composed_prompt_embeds_contract_evidence_and_anchors() {
        let prompt = compose(
            &question(),
            &ResponseContract::default(),
            &evidence_with_block(),
            PromptStyle::QuoteBypass,
        );
        assert!(prompt.text.contains("Does the loader validate inputs?"));
        assert!(prompt.text.contains("VERDICT="));
        assert!(prompt.text.contains("## step: files"));
        assert!(prompt.text.contains("CITE=Q1_files.json:1"));
        assert!(prompt.text.contains("- src/a.rs:10"));
    }

    #[test]
    fn prompt_filenames_follow_style() {
        assert_eq!(
            PromptStyle::Grounding.prompt_filename("Q1"),
            "Q1_augmented_prompt.md"
        );
        assert_eq!(
            PromptStyle::QuoteBypass.prompt_filename("Q1"),
            "Q1_bypass_prompt.md"
        );
    }
}
