//! Schema contract layer: semantic key discovery for row extraction.
//!
//! Engines evolve, so the key set carrying path/line/snippet information is
//! late-bound. Providers are consulted in priority order: the engine's schema
//! contract endpoint, the stored table's column list, and finally the keys
//! observed in the current preflight payloads.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::process::Command;

use crate::engines::EngineSpec;
use crate::table::TableCatalog;

/// Effective semantic key set for one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaContract {
    pub path_keys: Vec<String>,
    pub line_keys: Vec<String>,
    pub snippet_keys: Vec<String>,
    /// Which provider produced the key set, for the per-question audit log.
    pub source: ContractSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractSource {
    EngineEndpoint,
    TableColumns,
    ObservedKeys,
}

impl ContractSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractSource::EngineEndpoint => "engine_endpoint",
            ContractSource::TableColumns => "table_columns",
            ContractSource::ObservedKeys => "observed_keys",
        }
    }
}

const PATH_KEY_NAMES: &[&str] = &["path", "file_path", "file", "filename"];
const LINE_KEY_NAMES: &[&str] = &["line", "line_number", "lineno", "start_line"];
const SNIPPET_KEY_NAMES: &[&str] = &["snippet", "line_text", "text", "content", "excerpt"];

#[derive(Debug, Default, Deserialize)]
struct SemanticHints {
    #[serde(default)]
    path_keys: Vec<String>,
    #[serde(default)]
    line_keys: Vec<String>,
    #[serde(default)]
    snippet_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SchemaEndpointPayload {
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    semantic_hints: Option<SemanticHints>,
}

impl SchemaContract {
    /// First present path key in a row, with its value.
    pub fn row_path(&self, row: &Value) -> Option<String> {
        for key in &self.path_keys {
            if let Some(path) = row.get(key).and_then(Value::as_str) {
                if !path.is_empty() {
                    return Some(path.to_string());
                }
            }
        }
        None
    }

    pub fn row_line(&self, row: &Value) -> Option<u64> {
        for key in &self.line_keys {
            if let Some(line) = row.get(key).and_then(Value::as_u64) {
                return Some(line);
            }
        }
        None
    }

    pub fn row_snippet(&self, row: &Value) -> Option<String> {
        for key in &self.snippet_keys {
            if let Some(text) = row.get(key).and_then(Value::as_str) {
                if !text.is_empty() {
                    return Some(text.to_string());
                }
            }
        }
        None
    }
}

/// Discover the effective contract for one question.
///
/// Fails closed when the engine claims a semantic category but its contract
/// endpoint omits the corresponding hint list.
pub fn discover_contract(
    engine: &EngineSpec,
    catalog: &TableCatalog,
    observed_rows: &[Value],
) -> Result<SchemaContract> {
    if let Some(contract) = from_engine_endpoint(engine)? {
        return Ok(contract);
    }
    if let Some(contract) = from_table_columns(catalog) {
        return Ok(contract);
    }
    Ok(from_observed_keys(observed_rows))
}

fn from_engine_endpoint(engine: &EngineSpec) -> Result<Option<SchemaContract>> {
    if engine.schema_endpoint.is_empty() {
        return Ok(None);
    }
    let mut argv = engine.invocation.clone();
    argv.extend(engine.schema_endpoint.iter().cloned());
    let program = argv.remove(0);
    let output = Command::new(&program)
        .args(&argv)
        .output()
        .with_context(|| format!("run schema endpoint {program:?}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "schema endpoint failed: {}",
            stderr.trim().lines().next().unwrap_or_default()
        ));
    }
    let payload: SchemaEndpointPayload =
        serde_json::from_slice(&output.stdout).context("parse schema endpoint JSON")?;
    let hints = payload.semantic_hints.unwrap_or_default();

    // Declared support without the matching hint list is a contract breach.
    for (category, keys) in [
        ("paths", &hints.path_keys),
        ("lines", &hints.line_keys),
        ("snippets", &hints.snippet_keys),
    ] {
        if engine.supports.iter().any(|name| name == category) && keys.is_empty() {
            return Err(anyhow!(
                "schema contract breach: engine declares {category:?} support but \
                 the contract endpoint provides no {category} keys"
            ));
        }
    }

    if hints.path_keys.is_empty() && hints.line_keys.is_empty() && hints.snippet_keys.is_empty() {
        // Endpoint answered but offered nothing usable; fall through to the
        // next provider instead of treating an empty contract as authoritative.
        tracing::debug!(
            columns = payload.columns.len(),
            metadata = %payload.metadata,
            "schema endpoint returned no semantic hints"
        );
        return Ok(None);
    }

    Ok(Some(SchemaContract {
        path_keys: hints.path_keys,
        line_keys: hints.line_keys,
        snippet_keys: hints.snippet_keys,
        source: ContractSource::EngineEndpoint,
    }))
}

fn from_table_columns(catalog: &TableCatalog) -> Option<SchemaContract> {
    let pick = |names: &[&str]| -> Vec<String> {
        names
            .iter()
            .filter(|name| catalog.columns.iter().any(|column| column == *name))
            .map(|name| name.to_string())
            .collect()
    };
    let path_keys = pick(PATH_KEY_NAMES);
    if path_keys.is_empty() {
        return None;
    }
    Some(SchemaContract {
        path_keys,
        line_keys: pick(LINE_KEY_NAMES),
        snippet_keys: pick(SNIPPET_KEY_NAMES),
        source: ContractSource::TableColumns,
    })
}

fn from_observed_keys(rows: &[Value]) -> SchemaContract {
    let observed = |names: &[&str]| -> Vec<String> {
        names
            .iter()
            .filter(|name| {
                rows.iter()
                    .any(|row| row.get(**name).is_some_and(|value| !value.is_null()))
            })
            .map(|name| name.to_string())
            .collect()
    };
    SchemaContract {
        path_keys: observed(PATH_KEY_NAMES),
        line_keys: observed(LINE_KEY_NAMES),
        snippet_keys: observed(SNIPPET_KEY_NAMES),
        source: ContractSource::ObservedKeys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn catalog(columns: &[&str]) -> TableCatalog {
        TableCatalog {
            columns: columns.iter().map(|column| column.to_string()).collect(),
            path_universe: BTreeSet::new(),
        }
    }

    #[test]
    fn table_columns_provider_picks_known_names() {
        let contract = from_table_columns(&catalog(&["path", "line", "snippet", "grade"])).unwrap();
        assert_eq!(contract.path_keys, vec!["path"]);
        assert_eq!(contract.line_keys, vec!["line"]);
        assert_eq!(contract.snippet_keys, vec!["snippet"]);
        assert_eq!(contract.source, ContractSource::TableColumns);
    }

    #[test]
    fn observed_keys_provider_scans_rows() {
        let rows = vec![json!({"file_path": "src/a.rs", "lineno": 3})];
        let contract = from_observed_keys(&rows);
        assert_eq!(contract.path_keys, vec!["file_path"]);
        assert_eq!(contract.line_keys, vec!["lineno"]);
        assert!(contract.snippet_keys.is_empty());
        assert_eq!(contract.source, ContractSource::ObservedKeys);
    }

    #[test]
    fn row_extraction_uses_key_order() {
        let contract = SchemaContract {
            path_keys: vec!["path".to_string(), "file".to_string()],
            line_keys: vec!["line".to_string()],
            snippet_keys: vec!["text".to_string()],
            source: ContractSource::ObservedKeys,
        };
        let row = json!({"file": "src/b.rs", "line": 9, "text": "fn main() {}"});
        assert_eq!(contract.row_path(&row).as_deref(), Some("src/b.rs"));
        assert_eq!(contract.row_line(&row), Some(9));
        assert_eq!(contract.row_snippet(&row).as_deref(), Some("fn main() {}"));
    }
}
