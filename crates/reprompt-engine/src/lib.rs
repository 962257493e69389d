pub mod adapter;
pub mod error;
pub mod generation;
pub mod judge;
pub mod lm;
pub mod metric;
pub mod openai;
pub mod optimizer;
pub mod payload;
pub mod pipelines;
pub mod scoring;

#[cfg(test)]
mod testing;

pub use error::{MetricError, ServiceError};
pub use generation::{DryrunImageGenerator, GenerationRequest, ImageGenerator, OpenAiImageGenerator};
pub use judge::PersonaJudgeMetric;
pub use lm::{LanguageModel, OpenAiChatModel};
pub use metric::{evaluate, ImageReproductionMetric, Metric};
pub use openai::OpenAiClient;
pub use optimizer::{
    default_optimizer_registry, evaluate_program, run_optimization, Evaluator, OptimizationOutcome,
    Optimizer, OptimizerRegistry, RunLogs,
};
pub use payload::ImagePayload;
pub use pipelines::{ImageDescriptionPipeline, Pipeline, PredictRunner, ZundaMochiPipeline};
pub use scoring::{PerceptualJudge, SimilarityJudge, SimilarityScore, VisionJudge};
