#![deny(warnings)]

use anyhow::Context;
use clap::{ArgGroup, Parser};
use presentation_scorer_core::config::{
    resolve_api_key, resolve_optional_string, resolve_url_with_default, AppConfig,
    ClassifierConfig, Env, FailurePolicy, FrameSamples, OpenAiConfig, PipelineSettings, StdEnv,
    TranscriberConfig, WorkerCount, DEFAULT_CHAT_MODEL, DEFAULT_CLASSIFIER_URL,
    DEFAULT_EMBEDDING_MODEL, DEFAULT_FRAME_SAMPLES, DEFAULT_OPENAI_BASE_URL,
    DEFAULT_TRANSCRIPTION_MODEL, DEFAULT_WORKERS, ENV_EMOTION_CLASSIFIER_URL,
    ENV_OPENAI_API_KEY, ENV_OPENAI_BASE_URL, ENV_WHISPER_MODEL_PATH,
};
use presentation_scorer_core::content::{EmbeddingSimilarity, OpenAiEmbedder};
use presentation_scorer_core::emotion::RemoteFrameClassifier;
use presentation_scorer_core::llm::OpenAiChatClient;
use presentation_scorer_core::media::{FfmpegFrameSource, FfmpegMediaExtractor, VideoHandle};
use presentation_scorer_core::pipeline::{AnalysisRequest, Collaborators, Orchestrator};
use presentation_scorer_core::prosody::AutocorrelationProsodyAnalyzer;
use presentation_scorer_core::transcribe::{OpenAiTranscriber, Transcriber};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const MISSING_VIDEO_MESSAGE: &str = "Couldn't load video";

#[derive(Parser, Debug)]
#[command(name = "presentation-scorer")]
#[command(about = "Score a presentation video for confidence, content, emotion and grammar")]
#[command(group(
    ArgGroup::new("input")
        .required(true)
        .multiple(false)
        .args(["video", "batch"])
))]
struct Args {
    #[arg(long)]
    video: Option<PathBuf>,

    /// Topic the talk is supposed to cover.
    #[arg(long, conflicts_with = "batch")]
    topic: Option<String>,

    /// JSON array of `{"VideoPath": ..., "topic": ...}` entries.
    #[arg(long)]
    batch: Option<PathBuf>,

    #[arg(long)]
    openai_api_key: Option<String>,

    #[arg(long)]
    openai_base_url: Option<String>,

    #[arg(long, default_value = DEFAULT_CHAT_MODEL)]
    chat_model: String,

    #[arg(long, default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    #[arg(long, default_value = DEFAULT_TRANSCRIPTION_MODEL)]
    transcription_model: String,

    #[arg(long)]
    classifier_url: Option<String>,

    /// Local whisper.cpp model (requires the `whisper` feature).
    #[arg(long)]
    whisper_model: Option<String>,

    #[arg(long)]
    language: Option<String>,

    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    #[arg(long, default_value_t = DEFAULT_FRAME_SAMPLES)]
    frame_samples: u64,

    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long, default_value = "all-or-nothing")]
    failure_policy: String,

    #[arg(long, default_value_t = false)]
    pretty: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, PartialEq)]
enum Input {
    Single(AnalysisRequest),
    Batch(PathBuf),
}

#[derive(Debug)]
struct CliConfig {
    input: Input,
    app: AppConfig,
    pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let env = StdEnv;
    let cfg = build_config(args, &env)?;

    tracing::info!(
        workers = cfg.app.pipeline.workers.get(),
        frame_samples = cfg.app.pipeline.frame_samples.get(),
        failure_policy = ?cfg.app.pipeline.failure_policy,
        "config loaded"
    );

    let orchestrator = build_orchestrator(&cfg.app)?;
    let output = match cfg.input {
        Input::Single(request) => serde_json::to_value(orchestrator.run(request).await)?,
        Input::Batch(path) => run_batch(&orchestrator, &path).await?,
    };

    let rendered = if cfg.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{rendered}");
    Ok(())
}

async fn run_batch(orchestrator: &Orchestrator, path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read batch file {}", path.display()))?;
    let entries = parse_batch(&raw)?;

    let mut results = Vec::with_capacity(entries.len());
    for mut entry in entries {
        let message = match batch_request(&entry) {
            Some(request) if request.video.path().exists() => {
                serde_json::to_value(orchestrator.run(request).await)?
            }
            _ => {
                let shown = Value::Object(entry.clone());
                tracing::warn!(entry = %shown, "video not found");
                Value::String(MISSING_VIDEO_MESSAGE.to_owned())
            }
        };
        entry.insert("message".to_owned(), message);
        results.push(Value::Object(entry));
    }
    Ok(Value::Array(results))
}

fn parse_batch(raw: &str) -> anyhow::Result<Vec<Map<String, Value>>> {
    let entries: Vec<Map<String, Value>> =
        serde_json::from_str(raw).context("batch file must be a JSON array of objects")?;
    if entries.is_empty() {
        anyhow::bail!("batch file contains no entries");
    }
    Ok(entries)
}

fn batch_request(entry: &Map<String, Value>) -> Option<AnalysisRequest> {
    let video = entry.get("VideoPath")?.as_str()?;
    let topic = entry.get("topic").and_then(Value::as_str).map(str::to_owned);
    Some(AnalysisRequest::new(VideoHandle::new(video), topic))
}

fn build_orchestrator(cfg: &AppConfig) -> anyhow::Result<Orchestrator> {
    let api_key = cfg
        .openai
        .api_key
        .clone()
        .with_context(|| format!("an OpenAI API key is required (--openai-api-key or {ENV_OPENAI_API_KEY})"))?;
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build http client")?;

    let text = OpenAiChatClient::new(client.clone(), api_key.clone(), &cfg.openai)?;
    let embedder = OpenAiEmbedder::new(client.clone(), api_key.clone(), &cfg.openai)?;
    let classifier = RemoteFrameClassifier::new(client.clone(), &cfg.classifier)?;
    let transcriber = build_transcriber(cfg, client, api_key)?;

    let collaborators = Collaborators {
        extractor: Arc::new(FfmpegMediaExtractor::new()),
        transcriber,
        frames: Arc::new(FfmpegFrameSource::new()),
        classifier: Arc::new(classifier),
        prosody: Arc::new(AutocorrelationProsodyAnalyzer::default()),
        text: Arc::new(text),
        similarity: Arc::new(EmbeddingSimilarity::new(embedder)),
    };
    Ok(Orchestrator::new(collaborators, cfg.pipeline.clone()))
}

fn build_transcriber(
    cfg: &AppConfig,
    client: reqwest::Client,
    api_key: presentation_scorer_core::config::ApiKey,
) -> anyhow::Result<Arc<dyn Transcriber>> {
    #[cfg(feature = "whisper")]
    if let Some(model) = &cfg.transcriber.whisper_model_path {
        let whisper = presentation_scorer_core::transcribe::WhisperTranscriber::new(
            model,
            cfg.transcriber.language.clone(),
        )?;
        tracing::info!(model = %model, "using local whisper model");
        return Ok(Arc::new(whisper));
    }
    #[cfg(not(feature = "whisper"))]
    if cfg.transcriber.whisper_model_path.is_some() {
        tracing::warn!("built without the whisper feature, transcribing through the OpenAI API");
    }

    let remote = OpenAiTranscriber::new(client, api_key, &cfg.openai, cfg.transcriber.language.clone())?;
    Ok(Arc::new(remote))
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_config(args: Args, env: &impl Env) -> anyhow::Result<CliConfig> {
    let input = match (args.video, args.batch) {
        (Some(video), None) => Input::Single(AnalysisRequest::new(VideoHandle::new(video), args.topic)),
        (None, Some(batch)) => Input::Batch(batch),
        _ => anyhow::bail!("exactly one of --video or --batch must be provided"),
    };

    let openai = OpenAiConfig {
        api_key: resolve_api_key(args.openai_api_key, ENV_OPENAI_API_KEY, env)?,
        base_url: resolve_url_with_default(
            args.openai_base_url,
            ENV_OPENAI_BASE_URL,
            env,
            DEFAULT_OPENAI_BASE_URL,
        )?,
        chat_model: args.chat_model,
        embedding_model: args.embedding_model,
        transcription_model: args.transcription_model,
    };
    let classifier = ClassifierConfig {
        endpoint: resolve_url_with_default(
            args.classifier_url,
            ENV_EMOTION_CLASSIFIER_URL,
            env,
            DEFAULT_CLASSIFIER_URL,
        )?,
    };
    let transcriber = TranscriberConfig {
        whisper_model_path: resolve_optional_string(args.whisper_model, ENV_WHISPER_MODEL_PATH, env),
        language: args.language,
    };
    let pipeline = PipelineSettings {
        workers: WorkerCount::new(args.workers)?,
        frame_samples: FrameSamples::new(args.frame_samples)?,
        failure_policy: args.failure_policy.parse::<FailurePolicy>()?,
        task_timeout: args.timeout_secs.map(Duration::from_secs),
        ..PipelineSettings::default()
    };

    Ok(CliConfig {
        input,
        app: AppConfig {
            openai,
            classifier,
            transcriber,
            pipeline,
        },
        pretty: args.pretty,
    })
}
