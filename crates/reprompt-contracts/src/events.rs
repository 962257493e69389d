use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::runs::summary::now_utc_iso;

pub type EventPayload = Map<String, Value>;

const INLINE_DATA_PREFIX: &str = "data:";
const MAX_LOGGED_STRING_CHARS: usize = 2048;

/// Append-only writer for a run's `events.jsonl`.
///
/// - default fields are `type`, `run_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line, keys in sorted order
/// - inline image data and oversized strings are elided before writing
///
/// The file is opened on first emit and shared by all clones.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    run_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                run_id: run_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    /// Writer for a fresh run with a random run id.
    pub fn start(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Uuid::new_v4().to_string())
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = self.envelope(event_type, payload);
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut slot = self
            .shared
            .file
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        if slot.is_none() {
            *slot = Some(self.open()?);
        }
        if let Some(file) = slot.as_mut() {
            file.write_all(line.as_bytes()).with_context(|| {
                format!("failed appending to {}", self.shared.path.display())
            })?;
        }
        Ok(event)
    }

    fn envelope(&self, event_type: &str, payload: EventPayload) -> Value {
        let mut event = Map::new();
        event.insert("type".into(), Value::String(event_type.to_string()));
        event.insert("run_id".into(), Value::String(self.shared.run_id.clone()));
        event.insert("ts".into(), Value::String(now_utc_iso()));
        event.extend(
            payload
                .into_iter()
                .map(|(key, value)| (key, sanitize_value(&value))),
        );
        Value::Object(event)
    }

    fn open(&self) -> anyhow::Result<File> {
        let path = &self.shared.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed opening event log {}", path.display()))
    }

    /// Emits a `json!({...})` literal; non-object values are wrapped under `value`.
    pub fn emit_json(&self, event_type: &str, payload: Value) -> anyhow::Result<Value> {
        let payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.emit(event_type, payload)
    }
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(sanitize_text(text)),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_value).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(lowered.as_str(), "b64_json" | "image_bytes") {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_value(row));
            }
            Value::Object(out)
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
    }
}

fn sanitize_text(text: &str) -> String {
    if text.starts_with(INLINE_DATA_PREFIX) && text.contains(";base64,") {
        let header = text.split(',').next().unwrap_or(INLINE_DATA_PREFIX);
        return format!("{header},<omitted>");
    }
    if text.chars().count() <= MAX_LOGGED_STRING_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_LOGGED_STRING_CHARS).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn each_event_is_one_parseable_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let emitted = writer.emit_json("candidate_evaluated", json!({"mean_score": 0.75}))?;
        let content = fs::read_to_string(&path)?;
        assert!(content.ends_with('\n'));
        let recorded: Value = serde_json::from_str(content.trim_end())?;

        assert_eq!(recorded, emitted);
        assert_eq!(recorded["type"], json!("candidate_evaluated"));
        assert_eq!(recorded["run_id"], json!("run-123"));
        assert_eq!(recorded["mean_score"], json!(0.75));
        let line = content.trim_end();
        let key_order: Vec<usize> = ["\"mean_score\"", "\"run_id\"", "\"ts\"", "\"type\""]
            .iter()
            .filter_map(|key| line.find(key))
            .collect();
        assert_eq!(key_order.len(), 4);
        assert!(key_order.windows(2).all(|pair| pair[0] < pair[1]));
        DateTime::parse_from_rfc3339(recorded["ts"].as_str().unwrap_or_default())?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-123");

        let emitted = writer.emit_json(
            "run_started",
            json!({"type": "override", "run_id": "override-run"}),
        )?;

        assert_eq!(emitted["type"], json!("override"));
        assert_eq!(emitted["run_id"], json!("override-run"));
        Ok(())
    }

    #[test]
    fn emit_appends_lines_and_creates_parent_dirs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::start(&path);

        writer.emit("one", EventPayload::new())?;
        writer.emit("two", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["type"], json!("one"));
        assert_eq!(second["type"], json!("two"));
        assert_eq!(first["run_id"], second["run_id"]);
        assert!(!writer.run_id().is_empty());
        Ok(())
    }

    #[test]
    fn inline_image_data_is_elided() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-1");

        let emitted = writer.emit_json(
            "trial_scored",
            json!({
                "reference": "data:image/png;base64,iVBORw0KGgo=",
                "response": {"data": [{"b64_json": "aGVsbG8="}]},
                "score": 0.5,
            }),
        )?;

        assert_eq!(emitted["reference"], json!("data:image/png;base64,<omitted>"));
        assert_eq!(emitted["response"]["data"][0]["b64_json"], json!("<omitted>"));
        assert_eq!(emitted["score"], json!(0.5));
        Ok(())
    }

    #[test]
    fn non_object_payload_is_wrapped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-1");
        let emitted = writer.emit_json("note", json!("hello"))?;
        assert_eq!(emitted["value"], json!("hello"));
        Ok(())
    }
}
