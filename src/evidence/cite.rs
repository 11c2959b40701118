//! Citation token parsing and the line-overlap acceptance rule.
//!
//! A citation token is a canonical `path:line` or `path:start-end` string.
//! Tokens come from two places: structured row fields (path + line columns)
//! and explicit `CITE=<token>` anchors attached to rendered evidence blocks.

use std::sync::OnceLock;

use regex::Regex;

/// A parsed citation token. `line_end` is only set for range tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiteToken {
    pub path: String,
    pub line_start: Option<u64>,
    pub line_end: Option<u64>,
}

impl CiteToken {
    /// Parse a token of the form `path`, `path:12`, or `path:12-20`.
    ///
    /// Only the suffix after the last `:` is considered a line reference, so
    /// paths containing colons degrade to path-only tokens rather than
    /// failing.
    pub fn parse(raw: &str) -> Option<CiteToken> {
        let raw = raw.trim().trim_end_matches([',', ';', '.']);
        if raw.is_empty() {
            return None;
        }
        let Some((path, suffix)) = raw.rsplit_once(':') else {
            return Some(CiteToken {
                path: raw.to_string(),
                line_start: None,
                line_end: None,
            });
        };
        if path.is_empty() {
            return None;
        }
        if let Some((start, end)) = suffix.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) {
                return Some(CiteToken {
                    path: path.to_string(),
                    line_start: Some(start),
                    line_end: Some(end.max(start)),
                });
            }
        }
        if let Ok(line) = suffix.parse::<u64>() {
            return Some(CiteToken {
                path: path.to_string(),
                line_start: Some(line),
                line_end: None,
            });
        }
        Some(CiteToken {
            path: raw.to_string(),
            line_start: None,
            line_end: None,
        })
    }

    pub fn format(&self) -> String {
        match (self.line_start, self.line_end) {
            (Some(start), Some(end)) => format!("{}:{}-{}", self.path, start, end),
            (Some(start), None) => format!("{}:{}", self.path, start),
            _ => self.path.clone(),
        }
    }

    fn range(&self) -> Option<(u64, u64)> {
        let start = self.line_start?;
        Some((start, self.line_end.unwrap_or(start)))
    }

    /// Line-overlap acceptance: same path and intersecting line ranges.
    pub fn overlaps(&self, other: &CiteToken) -> bool {
        if self.path != other.path {
            return false;
        }
        match (self.range(), other.range()) {
            (Some((a_start, a_end)), Some((b_start, b_end))) => {
                a_start <= b_end && b_start <= a_end
            }
            _ => false,
        }
    }
}

/// Acceptance outcome for one cited token against the evidence allow-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAcceptance {
    Verbatim,
    Overlap,
    PathOnly,
    Rejected,
}

/// Judge one cited token against the evidence token allow-set.
///
/// Acceptance order: verbatim match, then line-range overlap, then (when the
/// caller allows it) a weakened path-only match.
pub fn judge_token(cited: &str, evidence_tokens: &[String], strict: bool) -> TokenAcceptance {
    if evidence_tokens.iter().any(|token| token == cited) {
        return TokenAcceptance::Verbatim;
    }
    let Some(parsed) = CiteToken::parse(cited) else {
        return TokenAcceptance::Rejected;
    };
    let mut path_seen = false;
    for raw in evidence_tokens {
        let Some(evidence) = CiteToken::parse(raw) else {
            continue;
        };
        if evidence.path == parsed.path {
            path_seen = true;
            if parsed.overlaps(&evidence) {
                return TokenAcceptance::Overlap;
            }
        }
    }
    if path_seen && !strict {
        return TokenAcceptance::PathOnly;
    }
    TokenAcceptance::Rejected
}

/// Split a citations header payload into raw token strings.
pub fn split_citation_list(payload: &str) -> Vec<String> {
    payload
        .split([',', ';'])
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn path_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Multi-segment tokens only: a lone word is almost never a repo path.
        Regex::new(r"[A-Za-z0-9_~.][A-Za-z0-9_.\-]*(?:/[A-Za-z0-9_.\-]+)+").unwrap()
    })
}

/// Extract repo-path-like tokens from free text, in first-seen order.
///
/// A trailing `:line` or `:start-end` suffix is stripped so `src/a.rs:10`
/// yields `src/a.rs`. Tokens with URL schemes are dropped.
pub fn extract_path_tokens(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in path_token_regex().find_iter(text) {
        let start = m.start();
        if start >= 3 && text[..start].ends_with("://") {
            continue;
        }
        let mut token = m.as_str().trim_end_matches(['.', ',', ';', ')']).to_string();
        if let Some((path, suffix)) = token.rsplit_once(':') {
            if suffix.chars().all(|ch| ch.is_ascii_digit() || ch == '-') {
                token = path.to_string();
            }
        }
        if token.contains('/') && !seen.contains(&token) {
            seen.push(token);
        }
    }
    seen
}
