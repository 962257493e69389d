use anyhow::{Context, Result};
use indexmap::IndexMap;
use reprompt_contracts::dataset::{Example, FieldValue, Prediction};
use reprompt_contracts::program::{Predictor, PredictorKind};
use reprompt_contracts::signatures::persona_judge;

use crate::metric::Metric;
use crate::pipelines::PredictRunner;
use crate::scoring::parse_similarity_score;

/// LLM-as-judge for persona answers: voice on a 0.0-0.8 scale, +0.2 for zunda mochi.
pub struct PersonaJudgeMetric {
    runner: PredictRunner,
    predictor: Predictor,
}

impl PersonaJudgeMetric {
    pub fn new(runner: PredictRunner) -> Self {
        Self {
            runner,
            predictor: Predictor::new("judge", PredictorKind::Predict, persona_judge()),
        }
    }
}

impl Metric for PersonaJudgeMetric {
    fn name(&self) -> &str {
        "persona_judge"
    }

    fn score(&self, example: &Example, prediction: &Prediction) -> Result<f64> {
        let correct = example
            .text("zunda_answer")
            .context("example has no zunda_answer")?;
        let predicted = prediction.require("answer_add_mochi")?;

        let mut inputs = IndexMap::new();
        inputs.insert(
            "correct_answer".to_string(),
            FieldValue::Text(correct.to_string()),
        );
        inputs.insert(
            "predicted_answer".to_string(),
            FieldValue::Text(predicted.to_string()),
        );
        let verdict = self.runner.predict(&self.predictor, &inputs)?;
        Ok(parse_similarity_score(verdict.require("score")?).value())
    }
}
