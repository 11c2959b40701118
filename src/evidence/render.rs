//! Bounded renderers turning filtered rows into evidence blocks.
//!
//! Four modes: `list` (bulleted rows), `block` (fenced code), `lines` (one
//! line per row), `json` (raw pretty JSON). Every block carries a `CITE=`
//! anchor naming the artifact it came from plus per-row `path:line` tokens
//! where the schema contract permits.

use serde_json::Value;

use crate::contract::SchemaContract;
use crate::evidence::EvidenceBlock;
use crate::pack::RenderMode;
const TRUNCATION_MARKER: &str = "\n[... evidence truncated ...]";

/// Render one step's filtered rows into an evidence block.
///
/// `raw_text` is the artifact's unparsed stdout, used by `block` mode when
/// the payload never was row-shaped.
pub fn render_block(
    step_name: &str,
    mode: RenderMode,
    rows: &[Value],
    raw_text: Option<&str>,
    artifact_basename: &str,
    contract: &SchemaContract,
    max_chars: usize,
) -> EvidenceBlock {
    let anchor = format!("{artifact_basename}:1");
    let mut tokens = vec![anchor.clone()];
    let mut paths = Vec::new();

    for row in rows {
        let Some(path) = contract.row_path(row) else {
            continue;
        };
        let token = match contract.row_line(row) {
            Some(line) => format!("{path}:{line}"),
            None => path.clone(),
        };
        if !tokens.contains(&token) {
            tokens.push(token);
        }
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    let body = match mode {
        RenderMode::List => render_list(rows, contract),
        RenderMode::Lines => render_lines(rows, contract),
        RenderMode::Block => render_fenced(rows, raw_text, contract),
        RenderMode::Json => render_json(rows),
    };
    let text = bound_text(&body, max_chars);

    EvidenceBlock {
        step: step_name.to_string(),
        render_mode: mode,
        text,
        anchor,
        tokens,
        paths,
        row_count: rows.len(),
    }
}

fn row_label(row: &Value, contract: &SchemaContract) -> String {
    let path = contract.row_path(row);
    let line = contract.row_line(row);
    let snippet = contract.row_snippet(row);
    match (path, line, snippet) {
        (Some(path), Some(line), Some(snippet)) => {
            format!("{path}:{line} - {}", snippet.trim())
        }
        (Some(path), Some(line), None) => format!("{path}:{line}"),
        (Some(path), None, Some(snippet)) => format!("{path} - {}", snippet.trim()),
        (Some(path), None, None) => path,
        (None, _, Some(snippet)) => snippet.trim().to_string(),
        _ => compact_json(row),
    }
}

fn render_list(rows: &[Value], contract: &SchemaContract) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str("- ");
        out.push_str(&row_label(row, contract));
        out.push('\n');
    }
    out
}

fn render_lines(rows: &[Value], contract: &SchemaContract) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&row_label(row, contract));
        out.push('\n');
    }
    out
}

fn render_fenced(rows: &[Value], raw_text: Option<&str>, contract: &SchemaContract) -> String {
    let mut out = String::from("```\n");
    if rows.is_empty() {
        if let Some(raw) = raw_text {
            out.push_str(raw.trim_end());
            out.push('\n');
        }
    } else {
        for row in rows {
            out.push_str(&row_label(row, contract));
            out.push('\n');
        }
    }
    out.push_str("```\n");
    out
}

fn render_json(rows: &[Value]) -> String {
    let mut out =
        serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string());
    out.push('\n');
    out
}

fn compact_json(row: &Value) -> String {
    serde_json::to_string(row).unwrap_or_else(|_| "{}".to_string())
}

fn bound_text(body: &str, max_chars: usize) -> String {
    if max_chars == 0 || body.len() <= max_chars {
        return body.to_string();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.len());
    let mut out = cut_at_char_boundary(body, keep).to_string();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Largest prefix of `text` no longer than `max` bytes that ends on a char
/// boundary, so truncation never splits a multi-byte snippet character.
fn cut_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}
