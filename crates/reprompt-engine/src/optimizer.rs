use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;
use reprompt_contracts::config::OptimizerConfig;
use reprompt_contracts::dataset::{Example, FieldValue};
use reprompt_contracts::events::EventWriter;
use reprompt_contracts::program::{Demo, ProgramState};
use reprompt_contracts::runs::summary::CandidateSummary;
use reprompt_contracts::runs::trials::{TrialLog, TrialRecord};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::metric::Metric;
use crate::pipelines::{Pipeline, PredictRunner};

/// Proposes program variants; the harness scores them.
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates to evaluate, the unmodified base first.
    fn propose_candidates(&self, base: &ProgramState, trainset: &[Example]) -> Result<Vec<ProgramState>>;

    fn score(
        &self,
        pipeline: &dyn Pipeline,
        runner: &PredictRunner,
        metric: &dyn Metric,
        example: &Example,
    ) -> Result<f64> {
        let prediction = pipeline.forward(runner, example)?;
        metric.score(example, &prediction)
    }
}

/// Base program plus one candidate per configured instruction variant.
///
/// Variant keys that name no predictor of the program are ignored; a variant
/// left with no applicable key is dropped.
pub struct InstructionSweep {
    variants: Vec<IndexMap<String, String>>,
}

impl InstructionSweep {
    pub fn new(variants: Vec<IndexMap<String, String>>) -> Self {
        Self { variants }
    }
}

impl Optimizer for InstructionSweep {
    fn name(&self) -> &str {
        "sweep"
    }

    fn propose_candidates(&self, base: &ProgramState, _trainset: &[Example]) -> Result<Vec<ProgramState>> {
        let mut candidates = vec![base.clone()];
        for variant in &self.variants {
            let mut candidate = base.clone();
            let mut applied = false;
            for (predictor_name, instructions) in variant {
                if let Some(predictor) = candidate.predictor_mut(predictor_name) {
                    predictor.instructions = instructions.trim().to_string();
                    applied = true;
                }
            }
            if applied && !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }
}

/// Attaches the first `k` training examples carrying every field of a predictor as its demos.
///
/// Examples only provide labels for fields they actually carry: unlabeled image
/// folders give no predictor a demo, which is an error rather than a silent
/// rerun of the base program.
pub struct LabeledFewShot {
    k: usize,
}

impl LabeledFewShot {
    pub fn new(k: usize) -> Self {
        Self { k }
    }
}

impl Optimizer for LabeledFewShot {
    fn name(&self) -> &str {
        "labeled"
    }

    fn propose_candidates(&self, base: &ProgramState, trainset: &[Example]) -> Result<Vec<ProgramState>> {
        let mut labeled = base.clone();
        let mut attached = 0usize;
        let mut wanted = Vec::new();
        for predictor in &mut labeled.predictors {
            let names: Vec<&str> = predictor
                .signature
                .input_names()
                .into_iter()
                .chain(predictor.signature.output_names())
                .collect();
            let demos: Vec<Demo> = trainset
                .iter()
                .filter(|example| example.has_all(&names))
                .take(self.k)
                .map(|example| demo_from_example(example, &names))
                .collect();
            attached += demos.len();
            wanted.push(format!("{} ({})", predictor.name, names.join(", ")));
            predictor.demos = demos;
        }
        if attached == 0 {
            bail!(
                "optimizer 'labeled' found no training example carrying every field of a predictor: {}",
                wanted.join("; ")
            );
        }
        if labeled == *base {
            return Ok(vec![base.clone()]);
        }
        Ok(vec![base.clone(), labeled])
    }
}

fn demo_from_example(example: &Example, names: &[&str]) -> Demo {
    names
        .iter()
        .filter_map(|name| {
            let value = match example.get(name)? {
                FieldValue::Text(text) => text.clone(),
                FieldValue::Image(path) => path.to_string_lossy().into_owned(),
            };
            Some((name.to_string(), value))
        })
        .collect()
}

#[derive(Default)]
pub struct OptimizerRegistry {
    optimizers: BTreeMap<String, Box<dyn Optimizer>>,
}

impl OptimizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<O: Optimizer + 'static>(&mut self, optimizer: O) {
        self.optimizers
            .insert(optimizer.name().to_string(), Box::new(optimizer));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Optimizer> {
        self.optimizers.get(name).map(|optimizer| optimizer.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.optimizers.keys().cloned().collect()
    }

    pub fn resolve(&self, name: &str) -> Result<&dyn Optimizer> {
        self.get(name).ok_or_else(|| {
            anyhow!(
                "unknown optimizer '{name}' (available: {})",
                self.names().join(", ")
            )
        })
    }
}

pub fn default_optimizer_registry(config: &OptimizerConfig) -> OptimizerRegistry {
    let mut registry = OptimizerRegistry::new();
    registry.register(InstructionSweep::new(config.candidates.clone()));
    registry.register(LabeledFewShot::new(config.max_labeled_demos));
    registry
}

/// Optional sinks for run events and per-trial records.
#[derive(Debug, Clone, Default)]
pub struct RunLogs {
    pub events: Option<EventWriter>,
    pub trials: Option<TrialLog>,
}

impl RunLogs {
    pub fn emit(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(events) = &self.events {
            events.emit_json(event_type, payload)?;
        }
        Ok(())
    }

    fn record(&self, trial: &TrialRecord) -> Result<()> {
        if let Some(trials) = &self.trials {
            trials.record(trial)?;
        }
        Ok(())
    }
}

/// Everything needed to score a program besides the program itself.
pub struct Evaluator<'a> {
    pub runner: &'a PredictRunner,
    pub metric: &'a dyn Metric,
    pub threads: usize,
    pub logs: &'a RunLogs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialFailure {
    pub example_index: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub candidate_id: String,
    /// One score per example in dataset order; failed trials count as 0.0.
    pub scores: Vec<f64>,
    pub failures: Vec<TrialFailure>,
}

impl EvaluationReport {
    pub fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().sum::<f64>() / self.scores.len() as f64
    }

    pub fn scored(&self) -> usize {
        self.scores.len() - self.failures.len()
    }

    pub fn summary(&self) -> CandidateSummary {
        CandidateSummary {
            candidate_id: self.candidate_id.clone(),
            mean_score: self.mean(),
            scored: self.scored() as u64,
            failed: self.failures.len() as u64,
        }
    }
}

/// Scores `pipeline` on every example using a bounded pool of scoped workers.
pub fn evaluate_program(
    evaluator: &Evaluator<'_>,
    optimizer: &dyn Optimizer,
    pipeline: &dyn Pipeline,
    examples: &[Example],
    candidate_id: &str,
) -> Result<EvaluationReport> {
    let workers = evaluator.threads.max(1).min(examples.len().max(1));
    let next = AtomicUsize::new(0);
    let mut outcomes: Vec<Option<Result<f64>>> = examples.iter().map(|_| None).collect();

    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<(usize, Result<f64>)>();
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move || loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(example) = examples.get(idx) else {
                    break;
                };
                let outcome = optimizer.score(pipeline, evaluator.runner, evaluator.metric, example);
                if tx.send((idx, outcome)).is_err() {
                    break;
                }
            });
        }
        drop(tx);
        for (idx, outcome) in rx {
            if let Some(slot) = outcomes.get_mut(idx) {
                *slot = Some(outcome);
            }
        }
    });

    let mut report = EvaluationReport {
        candidate_id: candidate_id.to_string(),
        scores: Vec::with_capacity(examples.len()),
        failures: Vec::new(),
    };
    for (idx, outcome) in outcomes.into_iter().enumerate() {
        let outcome = outcome.unwrap_or_else(|| Err(anyhow!("worker exited before scoring")));
        let (score, error) = match outcome {
            Ok(score) => (score, None),
            Err(err) => (0.0, Some(format!("{err:#}"))),
        };
        evaluator.logs.record(&TrialRecord {
            candidate_id: candidate_id.to_string(),
            example_index: idx,
            score,
            error: error.clone(),
        })?;
        match error {
            None => evaluator.logs.emit(
                "trial_scored",
                json!({"candidate_id": candidate_id, "example_index": idx, "score": score}),
            )?,
            Some(error) => {
                evaluator.logs.emit(
                    "trial_failed",
                    json!({"candidate_id": candidate_id, "example_index": idx, "error": error}),
                )?;
                report.failures.push(TrialFailure {
                    example_index: idx,
                    error,
                });
            }
        }
        report.scores.push(score);
    }
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub best_state: ProgramState,
    pub best_candidate_id: String,
    pub best_score: f64,
    pub reports: Vec<EvaluationReport>,
}

impl OptimizationOutcome {
    pub fn candidate_summaries(&self) -> Vec<CandidateSummary> {
        self.reports.iter().map(EvaluationReport::summary).collect()
    }
}

/// Evaluates every proposed candidate and keeps the best mean; earliest wins ties.
///
/// Scores on `valset`, or on `trainset` when `valset` is empty.
pub fn run_optimization(
    evaluator: &Evaluator<'_>,
    optimizer: &dyn Optimizer,
    pipeline: &dyn Pipeline,
    trainset: &[Example],
    valset: &[Example],
) -> Result<OptimizationOutcome> {
    let evalset = if valset.is_empty() { trainset } else { valset };
    if evalset.is_empty() {
        bail!("no examples to evaluate candidates on");
    }
    let candidates = optimizer.propose_candidates(pipeline.state(), trainset)?;
    if candidates.is_empty() {
        bail!("optimizer '{}' proposed no candidates", optimizer.name());
    }

    let mut best: Option<(usize, String, f64)> = None;
    let mut reports = Vec::with_capacity(candidates.len());
    for (idx, state) in candidates.iter().enumerate() {
        let candidate_id = candidate_id(idx, state);
        let predictors: Vec<Value> = state
            .predictors
            .iter()
            .map(|predictor| {
                json!({
                    "name": predictor.name,
                    "instructions": predictor.instructions,
                    "demos": predictor.demos.len(),
                })
            })
            .collect();
        evaluator.logs.emit(
            "candidate_proposed",
            json!({
                "candidate_id": candidate_id,
                "index": idx,
                "optimizer": optimizer.name(),
                "predictors": predictors,
            }),
        )?;

        let candidate = pipeline.with_state(state.clone())?;
        let report = evaluate_program(evaluator, optimizer, candidate.as_ref(), evalset, &candidate_id)?;
        let mean = report.mean();
        evaluator.logs.emit(
            "candidate_evaluated",
            json!({
                "candidate_id": candidate_id,
                "mean_score": mean,
                "scored": report.scored(),
                "failed": report.failures.len(),
            }),
        )?;

        let improves = best.as_ref().map_or(true, |(_, _, score)| mean > *score);
        if improves {
            best = Some((idx, candidate_id, mean));
        }
        reports.push(report);
    }

    if reports.iter().all(|report| report.scored() == 0) {
        let first = reports
            .iter()
            .find_map(|report| report.failures.first())
            .map(|failure| failure.error.clone())
            .unwrap_or_default();
        bail!("every trial failed (first error: {first})");
    }

    let Some((best_idx, best_candidate_id, best_score)) = best else {
        bail!("optimizer '{}' produced no scored candidate", optimizer.name());
    };
    Ok(OptimizationOutcome {
        best_state: candidates[best_idx].clone(),
        best_candidate_id,
        best_score,
        reports,
    })
}

/// `c<index>-<first 4 bytes of sha256(state json)>`.
pub fn candidate_id(index: usize, state: &ProgramState) -> String {
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("c{index}-{}", hex::encode(&digest[..4]))
}
