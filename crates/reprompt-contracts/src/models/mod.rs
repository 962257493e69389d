mod registry;

pub use registry::{ModelRegistry, ModelSpec, CAPABILITY_IMAGE, CAPABILITY_TEXT, CAPABILITY_VISION};
