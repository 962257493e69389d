use indexmap::IndexMap;

pub const CAPABILITY_IMAGE: &str = "image";
pub const CAPABILITY_VISION: &str = "vision";
pub const CAPABILITY_TEXT: &str = "text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Known model identifiers.
///
/// Identifiers are forwarded to the services verbatim whether or not they are
/// listed here; the registry only feeds warnings and `reprompt models` output.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

/// Built-in entries: name, provider, capabilities.
const BUILTIN_MODELS: &[(&str, &str, &[&str])] = &[
    ("gpt-image-1-mini", "openai", &[CAPABILITY_IMAGE]),
    ("gpt-image-1", "openai", &[CAPABILITY_IMAGE]),
    ("gpt-image-1.5", "openai", &[CAPABILITY_IMAGE]),
    ("dall-e-3", "openai", &[CAPABILITY_IMAGE]),
    ("dall-e-2", "openai", &[CAPABILITY_IMAGE]),
    ("gpt-4o-mini", "openai", &[CAPABILITY_TEXT, CAPABILITY_VISION]),
    ("gpt-4o", "openai", &[CAPABILITY_TEXT, CAPABILITY_VISION]),
    ("gpt-4.1-mini", "openai", &[CAPABILITY_TEXT, CAPABILITY_VISION]),
    ("gpt-4.1", "openai", &[CAPABILITY_TEXT, CAPABILITY_VISION]),
    ("dryrun-image-1", "dryrun", &[CAPABILITY_IMAGE]),
    ("perceptual-hash", "dryrun", &[CAPABILITY_VISION]),
];

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::from_specs(BUILTIN_MODELS.iter().map(|(name, provider, capabilities)| ModelSpec {
            name: (*name).to_string(),
            provider: (*provider).to_string(),
            capabilities: capabilities.iter().map(|cap| (*cap).to_string()).collect(),
        }))
    }
}

impl ModelRegistry {
    /// Later specs replace earlier ones with the same name but keep their position.
    pub fn from_specs(specs: impl IntoIterator<Item = ModelSpec>) -> Self {
        let models = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        Self { models }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.list()
            .filter(|spec| spec.supports(capability))
            .cloned()
            .collect()
    }

    pub fn supports(&self, name: &str, capability: &str) -> bool {
        self.get(name).is_some_and(|spec| spec.supports(capability))
    }

    /// Returns a human-readable warning when `name` is not a known `capability` model.
    pub fn warning_for(&self, name: &str, capability: &str) -> Option<String> {
        let message = match self.get(name) {
            Some(spec) if spec.supports(capability) => return None,
            Some(_) => format!(
                "Model '{name}' is not registered with capability '{capability}'; forwarding as-is."
            ),
            None => format!("Model '{name}' is not in the registry; forwarding as-is."),
        };
        Some(message)
    }
}
