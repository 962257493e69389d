use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub vision_lm: VisionLmConfig,
    pub image_generation: ImageGenerationConfig,
    pub evaluation: EvaluationConfig,
    pub persona: PersonaConfig,
    pub optimizer: OptimizerConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionLmConfig {
    pub model: String,
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageGenerationConfig {
    pub model: String,
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub task_model: String,
    pub judge_model: String,
    pub max_tokens: Option<u64>,
    pub train_ratio: f64,
}

/// Optimizer settings. `candidates` lists instruction variants for the
/// `sweep` optimizer, each mapping predictor name to instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub num_threads: usize,
    pub train_ratio: f64,
    pub max_labeled_demos: usize,
    pub candidates: Vec<IndexMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    Defaults,
}

impl ConfigSource {
    pub fn label(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Defaults => "defaults",
        }
    }
}

impl Default for VisionLmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: Some(1000),
        }
    }
}

impl Default for ImageGenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-image-1-mini".to_string(),
            size: "1024x1024".to_string(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            task_model: "gpt-4o-mini".to_string(),
            judge_model: "gpt-4o-mini".to_string(),
            max_tokens: None,
            train_ratio: 0.5,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            train_ratio: 2.0 / 3.0,
            max_labeled_demos: 3,
            candidates: Vec::new(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Some(120),
        }
    }
}

impl HttpConfig {
    /// `None` or `0` disables the client-side deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl OptimizerConfig {
    pub fn threads(&self) -> usize {
        self.num_threads.max(1)
    }
}

impl AppConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).context("invalid config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// Loads `path`, or falls back to defaults when the implicit default file is absent.
    pub fn load_or_default(path: &Path, explicit: bool) -> Result<(Self, ConfigSource)> {
        if !explicit && !path.exists() {
            return Ok((Self::default(), ConfigSource::Defaults));
        }
        Ok((Self::load(path)?, ConfigSource::File))
    }

    fn validate(&self) -> Result<()> {
        for (section, ratio) in [
            ("optimizer.train_ratio", self.optimizer.train_ratio),
            ("persona.train_ratio", self.persona.train_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                bail!("{section} must be within [0, 1] (got {ratio})");
            }
        }
        if self.image_generation.size.trim().is_empty() {
            bail!("image_generation.size must not be empty");
        }
        Ok(())
    }
}
