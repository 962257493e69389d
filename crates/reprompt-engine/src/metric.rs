use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use reprompt_contracts::dataset::{Example, Prediction};

use crate::error::MetricError;
use crate::generation::{GenerationRequest, ImageGenerator};
use crate::payload::ImagePayload;
use crate::scoring::{parse_similarity_score, ComparisonRequest, SimilarityJudge, SimilarityScore};

/// Scalar objective the optimizer maximizes. Called from worker threads.
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;
    fn score(&self, example: &Example, prediction: &Prediction) -> anyhow::Result<f64>;
}

/// Regenerates an image from `description` and rates it against the reference.
///
/// The reference is read before any network call. Only I/O and service failures
/// are errors; an unparseable judgment scores 0.0.
pub fn evaluate(
    generator: &dyn ImageGenerator,
    judge: &dyn SimilarityJudge,
    reference_image_path: &Path,
    description: &str,
    generation_model: &str,
    generation_size: &str,
    scoring_model: &str,
) -> Result<SimilarityScore, MetricError> {
    let original =
        ImagePayload::from_path(reference_image_path).map_err(|source| MetricError::ReadImage {
            path: reference_image_path.to_path_buf(),
            source,
        })?;

    let generated = generator
        .generate(&GenerationRequest::new(
            description,
            generation_model,
            generation_size,
        ))
        .map_err(MetricError::Generation)?;

    let comparison = ComparisonRequest::new(original, generated);
    let raw = judge
        .judge(&comparison, scoring_model)
        .map_err(MetricError::Scoring)?;
    Ok(parse_similarity_score(&raw))
}

/// Image-reproduction metric bound to its backends and model settings.
#[derive(Clone)]
pub struct ImageReproductionMetric {
    generator: Arc<dyn ImageGenerator>,
    judge: Arc<dyn SimilarityJudge>,
    generation_model: String,
    generation_size: String,
    scoring_model: String,
}

impl ImageReproductionMetric {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        judge: Arc<dyn SimilarityJudge>,
        generation_model: &str,
        generation_size: &str,
        scoring_model: &str,
    ) -> Self {
        Self {
            generator,
            judge,
            generation_model: generation_model.to_string(),
            generation_size: generation_size.to_string(),
            scoring_model: scoring_model.to_string(),
        }
    }

    pub fn evaluate(
        &self,
        reference_image_path: &Path,
        description: &str,
    ) -> Result<SimilarityScore, MetricError> {
        evaluate(
            self.generator.as_ref(),
            self.judge.as_ref(),
            reference_image_path,
            description,
            &self.generation_model,
            &self.generation_size,
            &self.scoring_model,
        )
    }
}

impl Metric for ImageReproductionMetric {
    fn name(&self) -> &str {
        "image_reproduction"
    }

    fn score(&self, example: &Example, prediction: &Prediction) -> anyhow::Result<f64> {
        let path = example
            .text("image_path")
            .map(Path::new)
            .or_else(|| example.image("image"))
            .context("example has neither image_path nor image")?;
        let description = prediction.require("description")?;
        let score = self.evaluate(path, description)?;
        Ok(score.value())
    }
}
