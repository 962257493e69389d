use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::signatures::Signature;

pub const PROGRAM_SCHEMA_VERSION: u64 = 1;

/// Few-shot demonstration: field name to rendered text.
pub type Demo = IndexMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    Predict,
    ChainOfThought,
}

impl PredictorKind {
    /// The signature the model actually answers for this predictor.
    pub fn effective_signature(self, signature: &Signature) -> Signature {
        match self {
            Self::Predict => signature.clone(),
            Self::ChainOfThought => signature.with_reasoning(),
        }
    }
}

/// One optimizable prompt slot: signature, current instructions and demos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predictor {
    pub name: String,
    pub kind: PredictorKind,
    pub signature: Signature,
    pub instructions: String,
    #[serde(default)]
    pub demos: Vec<Demo>,
}

impl Predictor {
    pub fn new(name: &str, kind: PredictorKind, signature: Signature) -> Self {
        Self {
            name: name.to_string(),
            kind,
            instructions: signature.instructions.clone(),
            signature,
            demos: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,
    pub program: String,
    pub predictors: Vec<Predictor>,
}

impl ProgramState {
    pub fn new(program: &str, predictors: Vec<Predictor>) -> Self {
        Self {
            schema_version: PROGRAM_SCHEMA_VERSION,
            program: program.to_string(),
            predictors,
        }
    }

    pub fn predictor(&self, name: &str) -> Option<&Predictor> {
        self.predictors
            .iter()
            .find(|predictor| predictor.name == name)
    }

    pub fn predictor_mut(&mut self, name: &str) -> Option<&mut Predictor> {
        self.predictors
            .iter_mut()
            .find(|predictor| predictor.name == name)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a saved program", path.display()))
    }

    /// Human-readable dump of each predictor's instructions and demos.
    pub fn render_inspection(&self) -> String {
        let separator = "=".repeat(60);
        let mut out = String::new();
        for predictor in &self.predictors {
            out.push_str(&format!("\n{separator}\nPredictor: {}\n{separator}\n", predictor.name));
            out.push_str(&format!("\n--- Instructions ---\n{}\n", predictor.instructions));
            out.push_str("\n--- Demos ---\n");
            if predictor.demos.is_empty() {
                out.push_str("  (no demos)\n");
                continue;
            }
            for (idx, demo) in predictor.demos.iter().enumerate() {
                out.push_str(&format!("\n[Demo {}]\n", idx + 1));
                for (key, value) in demo {
                    out.push_str(&format!("  {key}: {value}\n"));
                }
            }
        }
        out
    }
}

fn default_schema_version() -> u64 {
    PROGRAM_SCHEMA_VERSION
}
