//! Replicate mode: rerun the pack once per seed and compare verdicts.
//!
//! Each seed gets its own `seed_<n>/` subdirectory with a complete run. The
//! stability summary flags questions whose verdict changed across seeds.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::engines::EngineRegistry;
use crate::pack::Pack;
use crate::workflow::{execute_run, RunConfig, RunOutcome};

/// Per-seed verdicts for one question.
#[derive(Debug, Clone)]
struct QuestionStability {
    title: String,
    verdicts: Vec<(u64, Option<String>)>,
}

impl QuestionStability {
    fn is_stable(&self) -> bool {
        let mut distinct: Vec<&Option<String>> = Vec::new();
        for (_, verdict) in &self.verdicts {
            if !distinct.contains(&verdict) {
                distinct.push(verdict);
            }
        }
        distinct.len() <= 1
    }
}

/// Run the pack once per seed and write `STABILITY_SUMMARY.md`.
///
/// The reported exit code is the worst across seed runs.
pub fn run_replicates(
    config: &RunConfig,
    pack: &Pack,
    registry: &EngineRegistry,
    seeds: &[u64],
) -> Result<i32> {
    fs::create_dir_all(&config.out_dir)?;

    let mut stability: BTreeMap<String, QuestionStability> = BTreeMap::new();
    let mut worst_exit = 0;

    for seed in seeds {
        let mut seed_config = config.clone();
        seed_config.out_dir = config.out_dir.join(format!("seed_{seed}"));
        seed_config.seed = Some(*seed);
        tracing::info!(seed, out_dir = %seed_config.out_dir.display(), "replicate run start");

        let outcome = execute_run(&seed_config, pack, registry)?;
        record_verdicts(&mut stability, &outcome, *seed);
        if outcome.exit_code > worst_exit {
            worst_exit = outcome.exit_code;
        }
    }

    write_stability_summary(&config.out_dir, seeds, &stability)?;
    Ok(worst_exit)
}

fn record_verdicts(
    stability: &mut BTreeMap<String, QuestionStability>,
    outcome: &RunOutcome,
    seed: u64,
) {
    for question in &outcome.questions {
        stability
            .entry(question.id.clone())
            .or_insert_with(|| QuestionStability {
                title: question.title.clone(),
                verdicts: Vec::new(),
            })
            .verdicts
            .push((seed, question.verdict.clone()));
    }
}

fn write_stability_summary(
    out_dir: &Path,
    seeds: &[u64],
    stability: &BTreeMap<String, QuestionStability>,
) -> Result<()> {
    let mut out = String::new();
    out.push_str("# Stability Summary\n\n");
    out.push_str(&format!(
        "- seeds: {}\n- questions: {}\n",
        seeds
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        stability.len()
    ));
    let unstable: Vec<&String> = stability
        .iter()
        .filter(|(_, entry)| !entry.is_stable())
        .map(|(qid, _)| qid)
        .collect();
    out.push_str(&format!("- unstable questions: {}\n\n", unstable.len()));

    out.push_str("| question | title |");
    for seed in seeds {
        out.push_str(&format!(" seed {seed} |"));
    }
    out.push_str(" stable |\n");
    out.push_str("|---|---|");
    for _ in seeds {
        out.push_str("---|");
    }
    out.push_str("---|\n");

    for (qid, entry) in stability {
        out.push_str(&format!("| {qid} | {} |", entry.title));
        for seed in seeds {
            let verdict = entry
                .verdicts
                .iter()
                .find(|(verdict_seed, _)| verdict_seed == seed)
                .and_then(|(_, verdict)| verdict.as_deref())
                .unwrap_or("-");
            out.push_str(&format!(" {verdict} |"));
        }
        out.push_str(&format!(
            " {} |\n",
            if entry.is_stable() { "yes" } else { "NO" }
        ));
    }

    fs::write(out_dir.join("STABILITY_SUMMARY.md"), out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(verdicts: &[(u64, Option<&str>)]) -> QuestionStability {
        QuestionStability {
            title: "t".to_string(),
            verdicts: verdicts
                .iter()
                .map(|(seed, verdict)| (*seed, verdict.map(str::to_string)))
                .collect(),
        }
    }

    #[test]
    fn identical_verdicts_are_stable() {
        assert!(entry(&[(1, Some("TP")), (2, Some("TP"))]).is_stable());
    }

    #[test]
    fn differing_verdicts_are_unstable() {
        assert!(!entry(&[(1, Some("TP")), (2, Some("FP"))]).is_stable());
        assert!(!entry(&[(1, Some("TP")), (2, None)]).is_stable());
    }
}
