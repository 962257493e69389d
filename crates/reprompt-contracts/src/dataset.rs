use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Image(PathBuf),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&Path> {
        match self {
            Self::Image(path) => Some(path.as_path()),
            Self::Text(_) => None,
        }
    }
}

/// One training row: named values plus the subset of names fed to the program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub fields: IndexMap<String, FieldValue>,
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl Example {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields
            .insert(name.to_string(), FieldValue::Text(value.into()));
        self
    }

    pub fn with_image(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.fields
            .insert(name.to_string(), FieldValue::Image(path.into()));
        self
    }

    pub fn with_inputs(mut self, names: &[&str]) -> Self {
        self.inputs = names.iter().map(|name| (*name).to_string()).collect();
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    pub fn image(&self, name: &str) -> Option<&Path> {
        self.get(name).and_then(FieldValue::as_image)
    }

    pub fn has_all(&self, names: &[&str]) -> bool {
        names.iter().all(|name| self.fields.contains_key(*name))
    }

    /// Values of the declared input fields, in declaration order.
    pub fn input_values(&self) -> IndexMap<String, FieldValue> {
        self.inputs
            .iter()
            .filter_map(|name| {
                self.fields
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub fields: IndexMap<String, String>,
}

impl Prediction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .with_context(|| format!("prediction is missing field '{name}'"))
    }
}

/// Reads every supported image in `dir` (sorted by path) as an `image` example.
pub fn load_image_examples(dir: &Path) -> Result<Vec<Example>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed reading {}", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed listing {}", dir.display()))?
            .path();
        if !path.is_file() || !is_supported_image(&path) {
            continue;
        }
        paths.push(path);
    }
    paths.sort();

    Ok(paths
        .into_iter()
        .map(|path| {
            let path_text = path.to_string_lossy().to_string();
            Example::new()
                .with_image("image", path)
                .with_text("image_path", path_text)
                .with_inputs(&["image"])
        })
        .collect())
}

fn is_supported_image(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

/// Reads chat-format JSONL (`{"messages": [{"role", "content"}]}` per line)
/// into `question` / `zunda_answer` examples.
pub fn load_chat_examples(path: &Path) -> Result<Vec<Example>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mut examples = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let row: Value = serde_json::from_str(trimmed)
            .with_context(|| format!("{}:{line_no}: invalid JSON", path.display()))?;
        let Some(messages) = row.get("messages").and_then(Value::as_array) else {
            bail!("{}:{line_no}: missing 'messages' array", path.display());
        };

        let mut user_content: Option<String> = None;
        let mut assistant_content: Option<String> = None;
        for message in messages {
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string);
            match role {
                "user" => user_content = content,
                "assistant" => assistant_content = content,
                _ => {}
            }
        }

        let Some(question) = user_content else {
            bail!("{}:{line_no}: no user message", path.display());
        };
        let Some(answer) = assistant_content else {
            bail!("{}:{line_no}: no assistant message", path.display());
        };
        examples.push(
            Example::new()
                .with_text("question", question)
                .with_text("zunda_answer", answer)
                .with_inputs(&["question"]),
        );
    }
    Ok(examples)
}

/// Leading `floor(len * train_ratio)` rows train, the rest validate.
pub fn split_dataset<T: Clone>(examples: &[T], train_ratio: f64) -> (Vec<T>, Vec<T>) {
    let ratio = if train_ratio.is_finite() {
        train_ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let split_idx = ((examples.len() as f64) * ratio).floor() as usize;
    let split_idx = split_idx.min(examples.len());
    (
        examples[..split_idx].to_vec(),
        examples[split_idx..].to_vec(),
    )
}
