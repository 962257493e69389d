use std::sync::Arc;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use reprompt_contracts::dataset::{Example, FieldValue, Prediction};
use reprompt_contracts::program::{Predictor, PredictorKind, ProgramState};
use reprompt_contracts::signatures::{image_description, mochi_addition, zunda_answer};

use crate::adapter::{format_request, parse_completion};
use crate::lm::LanguageModel;

pub const IMAGE_DESCRIPTION_PROGRAM: &str = "image_description";
pub const ZUNDA_MOCHI_PROGRAM: &str = "zunda_mochi";

/// Runs single predictor calls against an injected language model.
#[derive(Clone)]
pub struct PredictRunner {
    lm: Arc<dyn LanguageModel>,
    model: String,
    max_tokens: Option<u64>,
}

impl PredictRunner {
    pub fn new(lm: Arc<dyn LanguageModel>, model: &str, max_tokens: Option<u64>) -> Self {
        Self {
            lm,
            model: model.to_string(),
            max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn predict(
        &self,
        predictor: &Predictor,
        inputs: &IndexMap<String, FieldValue>,
    ) -> Result<Prediction> {
        let request = format_request(predictor, inputs, &self.model, self.max_tokens)
            .with_context(|| format!("predictor '{}'", predictor.name))?;
        let completion = self
            .lm
            .complete(&request)
            .with_context(|| format!("predictor '{}' call failed", predictor.name))?;
        let signature = predictor.kind.effective_signature(&predictor.signature);
        let prediction = parse_completion(&signature, &completion)
            .with_context(|| format!("predictor '{}' returned an unusable completion", predictor.name))?;
        Ok(prediction)
    }
}

/// An optimizable program: fixed control flow over a mutable `ProgramState`.
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> &ProgramState;
    /// Same control flow with different instructions or demos.
    fn with_state(&self, state: ProgramState) -> Result<Box<dyn Pipeline>>;
    fn forward(&self, runner: &PredictRunner, example: &Example) -> Result<Prediction>;
}

fn require_predictor<'a>(state: &'a ProgramState, name: &str) -> Result<&'a Predictor> {
    state
        .predictor(name)
        .with_context(|| format!("program '{}' has no predictor '{name}'", state.program))
}

fn check_program(state: &ProgramState, expected: &str) -> Result<()> {
    if state.program != expected {
        bail!(
            "program state is for '{}', expected '{expected}'",
            state.program
        );
    }
    Ok(())
}

/// Image in, description out, through one chain-of-thought predictor.
#[derive(Debug, Clone)]
pub struct ImageDescriptionPipeline {
    state: ProgramState,
}

impl ImageDescriptionPipeline {
    pub const PREDICTOR: &'static str = "describe";

    pub fn new() -> Self {
        Self {
            state: ProgramState::new(
                IMAGE_DESCRIPTION_PROGRAM,
                vec![Predictor::new(
                    Self::PREDICTOR,
                    PredictorKind::ChainOfThought,
                    image_description(),
                )],
            ),
        }
    }

    pub fn from_state(state: ProgramState) -> Result<Self> {
        check_program(&state, IMAGE_DESCRIPTION_PROGRAM)?;
        require_predictor(&state, Self::PREDICTOR)?;
        Ok(Self { state })
    }
}

impl Default for ImageDescriptionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline for ImageDescriptionPipeline {
    fn name(&self) -> &str {
        IMAGE_DESCRIPTION_PROGRAM
    }

    fn state(&self) -> &ProgramState {
        &self.state
    }

    fn with_state(&self, state: ProgramState) -> Result<Box<dyn Pipeline>> {
        Ok(Box::new(Self::from_state(state)?))
    }

    fn forward(&self, runner: &PredictRunner, example: &Example) -> Result<Prediction> {
        let describe = require_predictor(&self.state, Self::PREDICTOR)?;
        runner.predict(describe, &example.input_values())
    }
}

/// Persona answer, then a rewrite that works zunda mochi into it.
#[derive(Debug, Clone)]
pub struct ZundaMochiPipeline {
    state: ProgramState,
}

impl ZundaMochiPipeline {
    pub const ANSWER_PREDICTOR: &'static str = "zunda_module";
    pub const MOCHI_PREDICTOR: &'static str = "mochi_module";

    pub fn new() -> Self {
        Self {
            state: ProgramState::new(
                ZUNDA_MOCHI_PROGRAM,
                vec![
                    Predictor::new(
                        Self::ANSWER_PREDICTOR,
                        PredictorKind::ChainOfThought,
                        zunda_answer(),
                    ),
                    Predictor::new(Self::MOCHI_PREDICTOR, PredictorKind::Predict, mochi_addition()),
                ],
            ),
        }
    }

    pub fn from_state(state: ProgramState) -> Result<Self> {
        check_program(&state, ZUNDA_MOCHI_PROGRAM)?;
        require_predictor(&state, Self::ANSWER_PREDICTOR)?;
        require_predictor(&state, Self::MOCHI_PREDICTOR)?;
        Ok(Self { state })
    }

    pub fn answer(&self, runner: &PredictRunner, question: &str) -> Result<Prediction> {
        let example = Example::new()
            .with_text("question", question)
            .with_inputs(&["question"]);
        self.forward(runner, &example)
    }
}

impl Default for ZundaMochiPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline for ZundaMochiPipeline {
    fn name(&self) -> &str {
        ZUNDA_MOCHI_PROGRAM
    }

    fn state(&self) -> &ProgramState {
        &self.state
    }

    fn with_state(&self, state: ProgramState) -> Result<Box<dyn Pipeline>> {
        Ok(Box::new(Self::from_state(state)?))
    }

    fn forward(&self, runner: &PredictRunner, example: &Example) -> Result<Prediction> {
        let answer_predictor = require_predictor(&self.state, Self::ANSWER_PREDICTOR)?;
        let mochi_predictor = require_predictor(&self.state, Self::MOCHI_PREDICTOR)?;

        let answered = runner.predict(answer_predictor, &example.input_values())?;
        let zunda = answered.require("zunda_answer")?.to_string();

        let mut mochi_inputs = IndexMap::new();
        mochi_inputs.insert("text".to_string(), FieldValue::Text(zunda.clone()));
        let rewritten = runner.predict(mochi_predictor, &mochi_inputs)?;

        let mut prediction = answered;
        prediction = prediction.with("zunda_answer", zunda);
        prediction = prediction.with("answer_add_mochi", rewritten.require("answer_add_mochi")?);
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLm;

    #[test]
    fn zunda_pipeline_feeds_first_answer_into_mochi_stage() -> Result<()> {
        let lm = Arc::new(ScriptedLm::new(&[
            "[[ ## reasoning ## ]]\n首都は東京。\n[[ ## zunda_answer ## ]]\n東京なのだ！\n[[ ## completed ## ]]",
            "[[ ## answer_add_mochi ## ]]\n東京なのだ！ずんだ餅も食べるのだ。\n[[ ## completed ## ]]",
        ]));
        let runner = PredictRunner::new(lm.clone(), "gpt-4o-mini", None);
        let prediction = ZundaMochiPipeline::new().answer(&runner, "日本の首都はどこですか")?;

        assert_eq!(prediction.get("zunda_answer"), Some("東京なのだ！"));
        assert_eq!(
            prediction.get("answer_add_mochi"),
            Some("東京なのだ！ずんだ餅も食べるのだ。")
        );

        let seen = lm.requests();
        assert_eq!(seen.len(), 2);
        let second_user = seen[1].messages.last().map(|message| message.text()).unwrap_or_default();
        assert!(second_user.starts_with("[[ ## text ## ]]\n東京なのだ！\n\n"));
        Ok(())
    }

    #[test]
    fn image_pipeline_describes_from_the_image_input() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("fox.png");
        std::fs::write(&path, b"\x89PNG\r\n\x1a\n")?;

        let lm = Arc::new(ScriptedLm::new(&["A red fox in snow"]));
        let runner = PredictRunner::new(lm.clone(), "gpt-4o-mini", Some(1000));
        let example = Example::new()
            .with_image("image", &path)
            .with_text("image_path", path.to_string_lossy())
            .with_inputs(&["image"]);
        let prediction = ImageDescriptionPipeline::new().forward(&runner, &example)?;
        assert_eq!(prediction.get("description"), Some("A red fox in snow"));

        let seen = lm.requests();
        assert_eq!(seen[0].max_tokens, Some(1000));
        assert_eq!(seen[0].model, "gpt-4o-mini");
        Ok(())
    }

    #[test]
    fn with_state_rejects_foreign_programs() {
        let zunda_state = ZundaMochiPipeline::new().state().clone();
        assert!(ImageDescriptionPipeline::new().with_state(zunda_state).is_err());

        let mut state = ImageDescriptionPipeline::new().state().clone();
        state.predictors.clear();
        assert!(ImageDescriptionPipeline::from_state(state).is_err());
    }

    #[test]
    fn lm_failure_names_the_predictor() {
        let runner = PredictRunner::new(Arc::new(ScriptedLm::new(&[])), "m", None);
        let err = ZundaMochiPipeline::new()
            .answer(&runner, "q")
            .err()
            .map(|err| format!("{err:#}"))
            .unwrap_or_default();
        assert!(err.contains("predictor 'zunda_module' call failed"));
    }
}
