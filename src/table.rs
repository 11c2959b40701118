//! Stored-table catalog: column list and path universe.
//!
//! The runner never links a parquet reader. Both facts it needs from the
//! table are fetched once per run through an external catalog CLI, the same
//! way every other deterministic query in the system goes through an engine
//! subprocess. The command is policy-owned so tests can substitute a script.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

/// Column names conventionally carrying file paths, checked in order.
pub const PATH_COLUMN_CANDIDATES: &[&str] = &["path", "file_path", "file", "filename"];

/// What the runner knows about the stored table.
#[derive(Debug, Clone)]
pub struct TableCatalog {
    pub columns: Vec<String>,
    /// Distinct values of the path column; the authoritative corpus.
    pub path_universe: BTreeSet<String>,
}

#[derive(Deserialize)]
struct DescribeRow {
    column_name: String,
}

#[derive(Deserialize)]
struct PathRow {
    path: String,
}

impl TableCatalog {
    pub fn contains_path(&self, path: &str) -> bool {
        self.path_universe.contains(path)
    }
}

/// Load the catalog by querying the table file through the catalog CLI.
pub fn load_catalog(catalog_cmd: &[String], parquet: &Path) -> Result<TableCatalog> {
    let table = sql_quote_literal(&parquet.display().to_string());

    let describe_sql = format!("DESCRIBE SELECT * FROM '{table}'");
    let describe_out = run_catalog_query(catalog_cmd, &describe_sql)?;
    let describe_rows: Vec<DescribeRow> =
        serde_json::from_slice(&describe_out).context("parse table column listing")?;
    let columns: Vec<String> = describe_rows
        .into_iter()
        .map(|row| row.column_name)
        .collect();
    if columns.is_empty() {
        return Err(anyhow!("table {} has no columns", parquet.display()));
    }

    let path_column = PATH_COLUMN_CANDIDATES
        .iter()
        .find(|candidate| columns.iter().any(|column| column == *candidate))
        .ok_or_else(|| {
            anyhow!(
                "table {} has no recognizable path column (columns: {})",
                parquet.display(),
                columns.join(", ")
            )
        })?;

    let paths_sql =
        format!("SELECT DISTINCT {path_column} AS path FROM '{table}' WHERE {path_column} IS NOT NULL");
    let paths_out = run_catalog_query(catalog_cmd, &paths_sql)?;
    let path_rows: Vec<PathRow> =
        serde_json::from_slice(&paths_out).context("parse table path universe")?;
    let path_universe: BTreeSet<String> = path_rows.into_iter().map(|row| row.path).collect();

    tracing::info!(
        columns = columns.len(),
        paths = path_universe.len(),
        "table catalog loaded"
    );

    Ok(TableCatalog {
        columns,
        path_universe,
    })
}

fn run_catalog_query(catalog_cmd: &[String], sql: &str) -> Result<Vec<u8>> {
    let program = catalog_cmd
        .first()
        .ok_or_else(|| anyhow!("catalog command is empty"))?;
    let start = Instant::now();
    let output = Command::new(program)
        .args(&catalog_cmd[1..])
        .arg(sql)
        .output()
        .with_context(|| format!("run catalog command {program:?}"))?;
    let elapsed_ms = start.elapsed().as_millis();

    tracing::debug!(
        elapsed_ms,
        sql_bytes = sql.len(),
        stdout_bytes = output.stdout.len(),
        "catalog query complete"
    );

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr_trimmed = stderr.trim();
    let stderr_line = stderr_trimmed.lines().next().unwrap_or_default();
    if !output.status.success() {
        let detail = if stderr_line.is_empty() {
            format!("status {}", output.status)
        } else {
            stderr_line.to_string()
        };
        return Err(anyhow!("catalog query failed: {detail}"));
    }
    // Some catalog CLIs report query failures on stderr with exit code 0.
    if !stderr_trimmed.is_empty()
        && (stderr_trimmed.contains("Error") || stderr_trimmed.contains("ERROR"))
    {
        return Err(anyhow!("catalog query failed: {stderr_line}"));
    }

    Ok(output.stdout)
}

fn sql_quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}
