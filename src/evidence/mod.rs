//! Evidence model: rendered blocks and their citation anchor tokens.

pub mod cite;
pub mod render;
pub mod transform;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::pack::RenderMode;

/// One rendered, bounded evidence block ready for prompt injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBlock {
    pub step: String,
    pub render_mode: RenderMode,
    /// Rendered body; the composer prefixes the step name and CITE anchor.
    pub text: String,
    /// The block-level `CITE=` anchor token (artifact basename + line 1).
    pub anchor: String,
    /// All citation tokens derivable from this block, anchor included.
    pub tokens: Vec<String>,
    /// Repo paths referenced by this block's rows.
    pub paths: Vec<String>,
    pub row_count: usize,
}

/// All evidence produced for one question.
#[derive(Debug, Clone, Default)]
pub struct EvidenceSet {
    pub blocks: Vec<EvidenceBlock>,
}

impl EvidenceSet {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Every citable token, deduplicated in first-seen order.
    pub fn allowed_tokens(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut tokens = Vec::new();
        for block in &self.blocks {
            for token in &block.tokens {
                if seen.insert(token.clone()) {
                    tokens.push(token.clone());
                }
            }
        }
        tokens
    }

    /// Repo paths present anywhere in the evidence.
    pub fn allowed_paths(&self) -> BTreeSet<String> {
        self.blocks
            .iter()
            .flat_map(|block| block.paths.iter().cloned())
            .collect()
    }

    /// Map of path to the evidence tokens citing it, in first-seen order.
    ///
    /// Used by the provenance repairer: the first token for a path is the
    /// one appended when the answer mentions the path without citing it.
    pub fn token_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for block in &self.blocks {
            for token in &block.tokens {
                let Some(parsed) = cite::CiteToken::parse(token) else {
                    continue;
                };
                let entry = map.entry(parsed.path).or_default();
                if !entry.contains(token) {
                    entry.push(token.clone());
                }
            }
        }
        map
    }
}
