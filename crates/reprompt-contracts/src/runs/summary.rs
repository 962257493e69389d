use std::path::Path;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub candidate_id: String,
    pub mean_score: f64,
    pub scored: u64,
    pub failed: u64,
}

/// Final record of one optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub optimizer: String,
    pub started_at: String,
    pub finished_at: String,
    pub train_examples: u64,
    pub eval_examples: u64,
    pub best_candidate_id: Option<String>,
    pub best_score: f64,
    pub candidates: Vec<CandidateSummary>,
    pub program_path: Option<String>,
}

#[derive(Serialize)]
struct SummaryFile<'a> {
    #[serde(flatten)]
    summary: &'a RunSummary,
    ts: String,
    #[serde(flatten)]
    extra: Option<&'a Map<String, Value>>,
}

/// Writes `summary.json`. Keys in `extra` win over summary fields of the same name.
pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    // Round-trip through `Value` so duplicate keys collapse to the last one.
    let document = serde_json::to_value(SummaryFile {
        summary,
        ts: now_utc_iso(),
        extra,
    })?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed creating {}", dir.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&document)?)
        .with_context(|| format!("failed writing {}", path.display()))
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
