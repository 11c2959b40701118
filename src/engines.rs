//! Engine registry: symbolic engine names resolved to CLI invocation specs.
//!
//! The runner never links against a query engine. Everything it knows about
//! one comes from this registry: how to prefix an invocation, which leading
//! subcommands need index/table flags injected, how to reach the chat
//! subcommand, and how to ask for the engine's schema contract.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Flag names for the engine's chat subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSpec {
    pub subcommand: String,
    pub prompt_flag: String,
    pub backend_flag: String,
    pub model_flag: String,
    pub top_k_flag: String,
    pub max_tokens_flag: String,
    pub temperature_flag: String,
    pub top_p_flag: String,
    pub num_ctx_flag: String,
    pub seed_flag: String,
    pub system_prompt_flag: String,
}

impl Default for ChatSpec {
    fn default() -> Self {
        ChatSpec {
            subcommand: "chat".to_string(),
            prompt_flag: "--prompt-file".to_string(),
            backend_flag: "--backend".to_string(),
            model_flag: "--model".to_string(),
            top_k_flag: "--top-k".to_string(),
            max_tokens_flag: "--max-tokens".to_string(),
            temperature_flag: "--temperature".to_string(),
            top_p_flag: "--top-p".to_string(),
            num_ctx_flag: "--num-ctx".to_string(),
            seed_flag: "--seed".to_string(),
            system_prompt_flag: "--system-prompt-file".to_string(),
        }
    }
}

/// One engine's invocation contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSpec {
    /// Leading argv used for every invocation of this engine.
    pub invocation: Vec<String>,
    /// Flag naming the audited repository root, when the engine takes one.
    #[serde(default)]
    pub target_dir_flag: Option<String>,
    /// Leading subcommands that get `index_flag`/`parquet_flag` injected.
    #[serde(default)]
    pub needs_index: Vec<String>,
    #[serde(default = "default_index_flag")]
    pub index_flag: String,
    #[serde(default = "default_parquet_flag")]
    pub parquet_flag: String,
    #[serde(default)]
    pub chat: ChatSpec,
    /// Invocation suffix that prints the engine's schema contract as JSON.
    #[serde(default)]
    pub schema_endpoint: Vec<String>,
    /// Semantic categories the engine claims to support (paths/lines/snippets).
    #[serde(default)]
    pub supports: Vec<String>,
}

fn default_index_flag() -> String {
    "--index".to_string()
}

fn default_parquet_flag() -> String {
    "--parquet".to_string()
}

/// Registry mapping engine names to specs, loaded once at startup.
#[derive(Debug, Clone)]
pub struct EngineRegistry {
    engines: BTreeMap<String, EngineSpec>,
}

#[derive(Debug, Deserialize)]
struct EngineSpecsFile {
    engines: BTreeMap<String, EngineSpec>,
}

impl EngineRegistry {
    /// Load engine specs from YAML, or fall back to the built-in registry.
    pub fn load(specs_path: Option<&Path>) -> Result<EngineRegistry> {
        let Some(path) = specs_path else {
            return Ok(EngineRegistry::builtin());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("read engine specs {}", path.display()))?;
        let file: EngineSpecsFile =
            serde_yaml::from_str(&text).context("parse engine specs YAML")?;
        if file.engines.is_empty() {
            return Err(anyhow!("engine specs file declares no engines"));
        }
        for (name, spec) in &file.engines {
            if spec.invocation.is_empty() {
                return Err(anyhow!("engine {name:?} has an empty invocation"));
            }
        }
        Ok(EngineRegistry {
            engines: file.engines,
        })
    }

    /// Built-in specs covering the conventional code and doc indexers.
    pub fn builtin() -> EngineRegistry {
        let mut engines = BTreeMap::new();
        engines.insert(
            "code-index".to_string(),
            EngineSpec {
                invocation: vec!["code-index".to_string()],
                target_dir_flag: Some("--target-dir".to_string()),
                needs_index: vec![
                    "search".to_string(),
                    "grep".to_string(),
                    "symbols".to_string(),
                    "chat".to_string(),
                ],
                index_flag: default_index_flag(),
                parquet_flag: default_parquet_flag(),
                chat: ChatSpec::default(),
                schema_endpoint: vec!["schema".to_string(), "--json".to_string()],
                supports: vec!["paths".to_string(), "lines".to_string(), "snippets".to_string()],
            },
        );
        engines.insert(
            "doc-index".to_string(),
            EngineSpec {
                invocation: vec!["doc-index".to_string()],
                target_dir_flag: Some("--target-dir".to_string()),
                needs_index: vec!["search".to_string(), "chat".to_string()],
                index_flag: default_index_flag(),
                parquet_flag: default_parquet_flag(),
                chat: ChatSpec::default(),
                schema_endpoint: vec!["schema".to_string(), "--json".to_string()],
                supports: vec!["paths".to_string(), "snippets".to_string()],
            },
        );
        EngineRegistry { engines }
    }

    pub fn get(&self, name: &str) -> Result<&EngineSpec> {
        self.engines.get(name).ok_or_else(|| {
            anyhow!(
                "unknown engine {name:?} (known: {})",
                self.engines.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    /// Resolve every referenced engine executable up front so a missing
    /// binary surfaces as an input error before any question runs.
    pub fn resolve_executables(&self, referenced: &[String]) -> Result<()> {
        for name in referenced {
            let spec = self.get(name)?;
            let program = spec
                .invocation
                .first()
                .ok_or_else(|| anyhow!("engine {name:?} has an empty invocation"))?;
            which::which(program)
                .map_err(|err| anyhow!("engine {name:?} executable {program:?}: {err}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_code_index() {
        let registry = EngineRegistry::builtin();
        let spec = registry.get("code-index").unwrap();
        assert_eq!(spec.invocation, vec!["code-index"]);
        assert!(spec.needs_index.contains(&"search".to_string()));
    }

    #[test]
    fn unknown_engine_is_an_error() {
        let registry = EngineRegistry::builtin();
        let err = registry.get("nope").unwrap_err().to_string();
        assert!(err.contains("unknown engine"));
        assert!(err.contains("code-index"));
    }

    #[test]
    fn specs_file_round_trips() {
        let yaml = r#"
engines:
  fake:
    invocation: ["/bin/sh", "fake-engine.sh"]
    needs_index: ["search"]
    supports: ["paths", "lines"]
    schema_endpoint: ["schema"]
"#;
        let file: EngineSpecsFile = serde_yaml::from_str(yaml).unwrap();
        let spec = &file.engines["fake"];
        assert_eq!(spec.invocation[0], "/bin/sh");
        assert_eq!(spec.index_flag, "--index");
        assert_eq!(spec.chat.subcommand, "chat");
    }
}
