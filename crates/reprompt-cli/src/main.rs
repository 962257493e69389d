use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use reprompt_contracts::config::{AppConfig, ConfigSource, DEFAULT_CONFIG_PATH};
use reprompt_contracts::dataset::{
    load_chat_examples, load_image_examples, split_dataset, Example,
};
use reprompt_contracts::events::EventWriter;
use reprompt_contracts::models::{
    ModelRegistry, CAPABILITY_IMAGE, CAPABILITY_TEXT, CAPABILITY_VISION,
};
use reprompt_contracts::program::ProgramState;
use reprompt_contracts::runs::summary::{now_utc_iso, write_summary, RunSummary};
use reprompt_contracts::runs::trials::TrialLog;
use reprompt_engine::{
    default_optimizer_registry, run_optimization, DryrunImageGenerator, Evaluator,
    ImageDescriptionPipeline, ImageGenerator, ImageReproductionMetric, LanguageModel, Metric,
    OpenAiChatModel, OpenAiClient, OpenAiImageGenerator, OptimizationOutcome, PerceptualJudge,
    PersonaJudgeMetric, Pipeline, PredictRunner, RunLogs, SimilarityJudge, VisionJudge,
    ZundaMochiPipeline,
};
use serde_json::{json, Map, Value};

const DEFAULT_QUESTION: &str = "日本の首都はどこですか";

#[derive(Debug, Parser)]
#[command(
    name = "reprompt",
    version,
    about = "Prompt optimization for image-description and persona pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Score one description against a reference image.
    Score(ScoreArgs),
    /// Describe an image with the (optionally optimized) description pipeline.
    Describe(DescribeArgs),
    /// Search description-pipeline instructions against a folder of reference images.
    OptimizeImages(OptimizeImagesArgs),
    /// Optimize the zundamon persona pipeline on a chat JSONL dataset.
    OptimizePersona(OptimizePersonaArgs),
    /// Print the instructions and demos of a saved program.
    Inspect(InspectArgs),
    /// List the known model identifiers and their capabilities.
    Models(ModelsArgs),
}

#[derive(Debug, Clone, Args)]
struct CommonArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ScoreArgs {
    #[arg(long)]
    reference: PathBuf,
    #[arg(long)]
    description: String,
    /// Use the local deterministic generator and perceptual-hash judge.
    #[arg(long)]
    offline: bool,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct DescribeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    program: Option<PathBuf>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct OptimizeImagesArgs {
    /// Image folders carry no reference descriptions, so few-shot labeling has nothing to attach.
    #[arg(long, default_value = "sweep", value_parser = ["sweep"])]
    optimizer: String,
    #[arg(long, default_value = "data/images")]
    images: PathBuf,
    #[arg(long, default_value = "experiments")]
    out: PathBuf,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct OptimizePersonaArgs {
    #[arg(long, default_value = "labeled", value_parser = ["sweep", "labeled"])]
    optimizer: String,
    #[arg(long, default_value = "data/zmn.jsonl")]
    data: PathBuf,
    #[arg(long, default_value = "results")]
    out: PathBuf,
    #[arg(long, default_value = DEFAULT_QUESTION)]
    question: String,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct InspectArgs {
    #[arg(long)]
    program: PathBuf,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    #[arg(long, value_parser = [CAPABILITY_IMAGE, CAPABILITY_VISION, CAPABILITY_TEXT])]
    capability: Option<String>,
}

fn main() {
    dotenvy::dotenv().ok();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("reprompt error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Score(args) => run_score(args),
        Command::Describe(args) => run_describe(args),
        Command::OptimizeImages(args) => run_optimize_images(args),
        Command::OptimizePersona(args) => run_optimize_persona(args),
        Command::Inspect(args) => run_inspect(args),
        Command::Models(args) => run_models(args),
    }
}

/// Loaded config plus the optional event log of one command invocation.
struct Session {
    config: AppConfig,
    events: Option<EventWriter>,
    registry: ModelRegistry,
    started_at: String,
}

impl Session {
    fn open(command: &str, common: &CommonArgs, default_events: Option<PathBuf>) -> Result<Self> {
        let explicit = common.config.is_some();
        let config_path = common
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let (config, source) = AppConfig::load_or_default(&config_path, explicit)?;
        let events = common
            .events
            .clone()
            .or(default_events)
            .map(EventWriter::start);

        let session = Self {
            config,
            events,
            registry: ModelRegistry::default(),
            started_at: now_utc_iso(),
        };
        session.emit("run_started", json!({"command": command}))?;
        let config_path_value = match source {
            ConfigSource::File => Value::String(config_path.to_string_lossy().to_string()),
            ConfigSource::Defaults => Value::Null,
        };
        session.emit(
            "config_loaded",
            json!({"path": config_path_value, "source": source.label()}),
        )?;
        Ok(session)
    }

    fn emit(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(events) = &self.events {
            events.emit_json(event_type, payload)?;
        }
        Ok(())
    }

    fn run_id(&self) -> String {
        self.events
            .as_ref()
            .map(|events| events.run_id().to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Unknown models are forwarded verbatim; this only warns.
    fn check_model(&self, model: &str, capability: &str) -> Result<()> {
        if let Some(message) = self.registry.warning_for(model, capability) {
            eprintln!("reprompt warning: {message}");
            self.emit(
                "model_warning",
                json!({"model": model, "capability": capability, "message": message}),
            )?;
        }
        Ok(())
    }

    fn client(&self) -> Result<OpenAiClient> {
        Ok(OpenAiClient::from_env(self.config.http.timeout())?)
    }
}

fn run_score(args: ScoreArgs) -> Result<i32> {
    let session = Session::open("score", &args.common, None)?;
    let config = &session.config;

    let (generator, judge) = if args.offline {
        offline_backends()
    } else {
        session.check_model(&config.image_generation.model, CAPABILITY_IMAGE)?;
        session.check_model(&config.evaluation.model, CAPABILITY_VISION)?;
        openai_backends(session.client()?)
    };

    let metric = ImageReproductionMetric::new(
        generator.clone(),
        judge.clone(),
        &config.image_generation.model,
        &config.image_generation.size,
        &config.evaluation.model,
    );
    let score = metric.evaluate(&args.reference, &args.description)?;
    session.emit(
        "run_finished",
        json!({
            "command": "score",
            "reference": args.reference.to_string_lossy(),
            "generator": generator.name(),
            "judge": judge.name(),
            "score": score.value(),
        }),
    )?;
    println!("{score}");
    Ok(0)
}

type ScoringBackends = (Arc<dyn ImageGenerator>, Arc<dyn SimilarityJudge>);

fn offline_backends() -> ScoringBackends {
    (Arc::new(DryrunImageGenerator), Arc::new(PerceptualJudge))
}

fn openai_backends(client: OpenAiClient) -> ScoringBackends {
    let lm: Arc<dyn LanguageModel> = Arc::new(OpenAiChatModel::new(client.clone()));
    (
        Arc::new(OpenAiImageGenerator::new(client)),
        Arc::new(VisionJudge::new(lm)),
    )
}

fn run_describe(args: DescribeArgs) -> Result<i32> {
    let session = Session::open("describe", &args.common, None)?;
    let config = &session.config;
    session.check_model(&config.vision_lm.model, CAPABILITY_VISION)?;

    let pipeline = match &args.program {
        Some(path) => ImageDescriptionPipeline::from_state(ProgramState::load(path)?)?,
        None => ImageDescriptionPipeline::new(),
    };
    let lm: Arc<dyn LanguageModel> = Arc::new(OpenAiChatModel::new(session.client()?));
    let runner = PredictRunner::new(lm, &config.vision_lm.model, config.vision_lm.max_tokens);

    let example = image_example(&args.image);
    let prediction = pipeline.forward(&runner, &example)?;
    let description = prediction.require("description")?;
    session.emit(
        "run_finished",
        json!({"command": "describe", "image": args.image.to_string_lossy(), "description": description}),
    )?;
    println!("{description}");
    Ok(0)
}

fn image_example(path: &Path) -> Example {
    Example::new()
        .with_image("image", path)
        .with_text("image_path", path.to_string_lossy())
        .with_inputs(&["image"])
}

fn run_optimize_images(args: OptimizeImagesArgs) -> Result<i32> {
    let examples = if args.images.is_dir() {
        load_image_examples(&args.images)?
    } else {
        Vec::new()
    };
    if examples.is_empty() {
        println!(
            "No images found in {}; add .jpg/.jpeg/.png/.webp/.gif files and rerun.",
            args.images.display()
        );
        return Ok(0);
    }

    fs::create_dir_all(&args.out)?;
    let session = Session::open(
        "optimize-images",
        &args.common,
        Some(args.out.join("events.jsonl")),
    )?;
    let config = &session.config;
    session.check_model(&config.vision_lm.model, CAPABILITY_VISION)?;
    session.check_model(&config.image_generation.model, CAPABILITY_IMAGE)?;
    session.check_model(&config.evaluation.model, CAPABILITY_VISION)?;

    let (trainset, valset) = split_dataset(&examples, config.optimizer.train_ratio);
    session.emit(
        "dataset_loaded",
        json!({
            "path": args.images.to_string_lossy(),
            "examples": examples.len(),
            "train": trainset.len(),
            "val": valset.len(),
        }),
    )?;

    let client = session.client()?;
    let lm: Arc<dyn LanguageModel> = Arc::new(OpenAiChatModel::new(client.clone()));
    let runner = PredictRunner::new(lm.clone(), &config.vision_lm.model, config.vision_lm.max_tokens);
    let metric = ImageReproductionMetric::new(
        Arc::new(OpenAiImageGenerator::new(client)),
        Arc::new(VisionJudge::new(lm)),
        &config.image_generation.model,
        &config.image_generation.size,
        &config.evaluation.model,
    );

    let program_path = args
        .out
        .join(format!("optimized_pipeline_{}.json", args.optimizer));
    let job = OptimizeJob {
        optimizer: &args.optimizer,
        pipeline: &ImageDescriptionPipeline::new(),
        runner: &runner,
        metric: &metric,
        out: &args.out,
        program_path: &program_path,
    };
    let outcome = optimize(&session, &job, &trainset, &valset)?;

    println!(
        "Best candidate {} scored {:.4}; saved {}",
        outcome.best_candidate_id,
        outcome.best_score,
        program_path.display()
    );
    Ok(0)
}

fn run_optimize_persona(args: OptimizePersonaArgs) -> Result<i32> {
    let examples = load_chat_examples(&args.data)?;
    if examples.is_empty() {
        println!("No conversations found in {}.", args.data.display());
        return Ok(0);
    }

    fs::create_dir_all(&args.out)?;
    let session = Session::open(
        "optimize-persona",
        &args.common,
        Some(args.out.join("events.jsonl")),
    )?;
    let config = &session.config;
    session.check_model(&config.persona.task_model, CAPABILITY_TEXT)?;
    session.check_model(&config.persona.judge_model, CAPABILITY_TEXT)?;

    let (trainset, valset) = split_dataset(&examples, config.persona.train_ratio);
    session.emit(
        "dataset_loaded",
        json!({
            "path": args.data.to_string_lossy(),
            "examples": examples.len(),
            "train": trainset.len(),
            "val": valset.len(),
        }),
    )?;

    let lm: Arc<dyn LanguageModel> = Arc::new(OpenAiChatModel::new(session.client()?));
    let runner = PredictRunner::new(lm.clone(), &config.persona.task_model, config.persona.max_tokens);
    let metric = PersonaJudgeMetric::new(PredictRunner::new(lm, &config.persona.judge_model, None));

    let program_path = args.out.join("program.json");
    let job = OptimizeJob {
        optimizer: &args.optimizer,
        pipeline: &ZundaMochiPipeline::new(),
        runner: &runner,
        metric: &metric,
        out: &args.out,
        program_path: &program_path,
    };
    let outcome = optimize(&session, &job, &trainset, &valset)?;

    let optimized = ZundaMochiPipeline::from_state(outcome.best_state)?;
    let answer = optimized.answer(&runner, &args.question)?;
    println!("Question: {}", args.question);
    println!("Answer: {}", answer.require("zunda_answer")?);
    println!("With mochi: {}", answer.require("answer_add_mochi")?);
    println!(
        "Best score {:.4}; saved {}",
        outcome.best_score,
        program_path.display()
    );
    Ok(0)
}

struct OptimizeJob<'a> {
    optimizer: &'a str,
    pipeline: &'a dyn Pipeline,
    runner: &'a PredictRunner,
    metric: &'a dyn Metric,
    out: &'a Path,
    program_path: &'a Path,
}

/// Runs the optimizer, saves the winner and writes `summary.json` next to it.
fn optimize(
    session: &Session,
    job: &OptimizeJob<'_>,
    trainset: &[Example],
    valset: &[Example],
) -> Result<OptimizationOutcome> {
    let config = &session.config;
    let registry = default_optimizer_registry(&config.optimizer);
    let optimizer = registry.resolve(job.optimizer)?;
    if optimizer.name() == "sweep" && config.optimizer.candidates.is_empty() {
        eprintln!("reprompt warning: optimizer.candidates is empty; only the base program is scored");
    }

    let run_id = session.run_id();
    let logs = RunLogs {
        events: session.events.clone(),
        trials: Some(TrialLog::new(job.out.join("trials.jsonl"), run_id.clone())),
    };
    let evaluator = Evaluator {
        runner: job.runner,
        metric: job.metric,
        threads: config.optimizer.threads(),
        logs: &logs,
    };
    let outcome = run_optimization(&evaluator, optimizer, job.pipeline, trainset, valset)?;

    outcome.best_state.save(job.program_path)?;
    session.emit(
        "program_saved",
        json!({"path": job.program_path.to_string_lossy(), "candidate_id": outcome.best_candidate_id}),
    )?;

    let summary = RunSummary {
        run_id,
        optimizer: optimizer.name().to_string(),
        started_at: session.started_at.clone(),
        finished_at: now_utc_iso(),
        train_examples: trainset.len() as u64,
        eval_examples: if valset.is_empty() {
            trainset.len() as u64
        } else {
            valset.len() as u64
        },
        best_candidate_id: Some(outcome.best_candidate_id.clone()),
        best_score: outcome.best_score,
        candidates: outcome.candidate_summaries(),
        program_path: Some(job.program_path.to_string_lossy().to_string()),
    };
    let mut extra = Map::new();
    extra.insert(
        "pipeline".to_string(),
        Value::String(job.pipeline.name().to_string()),
    );
    extra.insert("metric".to_string(), Value::String(job.metric.name().to_string()));
    write_summary(&job.out.join("summary.json"), &summary, Some(&extra))?;

    session.emit(
        "run_finished",
        json!({
            "best_candidate_id": outcome.best_candidate_id,
            "best_score": outcome.best_score,
            "candidates": outcome.reports.len(),
        }),
    )?;
    Ok(outcome)
}

fn run_inspect(args: InspectArgs) -> Result<i32> {
    if !args.program.exists() {
        bail!("program file not found: {}", args.program.display());
    }
    let state = ProgramState::load(&args.program)?;
    print!("{}", state.render_inspection());
    Ok(0)
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    let registry = ModelRegistry::default();
    let models = match &args.capability {
        Some(capability) => registry.by_capability(capability),
        None => registry.list().cloned().collect(),
    };
    for model in models {
        println!(
            "{:<20} {:<10} {}",
            model.name,
            model.provider,
            model.capabilities.join(",")
        );
    }
    Ok(0)
}
