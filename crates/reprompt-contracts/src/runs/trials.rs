use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::Value;

use super::summary::now_utc_iso;

/// Outcome of scoring one candidate program against one example.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub candidate_id: String,
    pub example_index: usize,
    /// Non-finite scores are written as `null`.
    pub score: f64,
    pub error: Option<String>,
}

#[derive(Serialize)]
struct TrialLine<'a> {
    ts: String,
    run_id: &'a str,
    #[serde(flatten)]
    trial: &'a TrialRecord,
}

/// Append-only `trials.jsonl` ledger shared by evaluation workers.
#[derive(Debug, Clone)]
pub struct TrialLog {
    path: PathBuf,
    run_id: Arc<str>,
    write_lock: Arc<Mutex<()>>,
}

impl TrialLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            run_id: Arc::from(run_id.into()),
            write_lock: Arc::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line and returns it as written.
    pub fn record(&self, trial: &TrialRecord) -> anyhow::Result<Value> {
        let line = serde_json::to_value(TrialLine {
            ts: now_utc_iso(),
            run_id: &self.run_id,
            trial,
        })?;
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');

        let _held = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("trial log lock poisoned"))?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed creating {}", dir.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&encoded))
            .with_context(|| format!("failed appending to {}", self.path.display()))?;
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{TrialLog, TrialRecord};

    #[test]
    fn trial_log_appends_jsonl_records() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("trials.jsonl");
        let log = TrialLog::new(&path, "run-123");

        let written = log.record(&TrialRecord {
            candidate_id: "c0".to_string(),
            example_index: 2,
            score: 0.75,
            error: None,
        })?;
        assert_eq!(written["candidate_id"], json!("c0"));
        assert_eq!(written["run_id"], json!("run-123"));
        assert_eq!(written["error"], Value::Null);

        log.record(&TrialRecord {
            candidate_id: "c1".to_string(),
            example_index: 0,
            score: 0.0,
            error: Some("image generation call failed".to_string()),
        })?;

        let raw = std::fs::read_to_string(path)?;
        let rows: Vec<Value> = raw
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["score"], json!(0.75));
        assert_eq!(rows[0]["example_index"], json!(2));
        assert_eq!(rows[1]["error"], json!("image generation call failed"));
        assert!(rows[1].get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }

    #[test]
    fn nan_score_is_written_as_null() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = TrialLog::new(temp.path().join("trials.jsonl"), "run-1");
        let written = log.record(&TrialRecord {
            candidate_id: "c2".to_string(),
            example_index: 1,
            score: f64::NAN,
            error: None,
        })?;
        assert_eq!(written["score"], Value::Null);
        Ok(())
    }

    #[test]
    fn clones_share_one_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = TrialLog::new(temp.path().join("trials.jsonl"), "run-1");
        let handles: Vec<_> = (0..4)
            .map(|idx| {
                let log = log.clone();
                std::thread::spawn(move || {
                    log.record(&TrialRecord {
                        candidate_id: "c0".to_string(),
                        example_index: idx,
                        score: 0.5,
                        error: None,
                    })
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }
        let raw = std::fs::read_to_string(log.path())?;
        assert_eq!(raw.lines().count(), 4);
        Ok(())
    }
}
