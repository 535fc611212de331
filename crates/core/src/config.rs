use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use url::Url;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";
pub const DEFAULT_CLASSIFIER_URL: &str = "http://127.0.0.1:8501/v1/emotion";
pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_FRAME_SAMPLES: u64 = 100;
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
pub const ENV_EMOTION_CLASSIFIER_URL: &str = "EMOTION_CLASSIFIER_URL";
pub const ENV_WHISPER_MODEL_PATH: &str = "WHISPER_MODEL_PATH";

/// Secret credential. Never serialized, and redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new<S: Into<String>>(value: S) -> Result<Self, ConfigError> {
        let v = value.into();
        if v.trim().is_empty() {
            return Err(ConfigError::EmptyApiKey);
        }
        Ok(Self(v))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(**redacted**)")
    }
}

/// Number of top-level analysis tasks allowed to run at the same time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerCount(usize);

impl WorkerCount {
    pub fn new(workers: usize) -> Result<Self, ConfigError> {
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(Self(workers))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        Self(DEFAULT_WORKERS)
    }
}

/// Target number of frames sampled from a video for emotion classification.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameSamples(u64);

impl FrameSamples {
    pub fn new(samples: u64) -> Result<Self, ConfigError> {
        if samples == 0 {
            return Err(ConfigError::ZeroFrameSamples);
        }
        Ok(Self(samples))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Default for FrameSamples {
    fn default() -> Self {
        Self(DEFAULT_FRAME_SAMPLES)
    }
}

/// How the orchestrator reacts to a failing analysis task.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Any task failure zeroes the whole bundle and marks the outcome as failed.
    #[default]
    AllOrNothing,
    /// A failed task zeroes only its own fields. Extraction failures and
    /// missing speech still fail the whole request.
    PerTask,
}

impl std::str::FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all-or-nothing" => Ok(Self::AllOrNothing),
            "per-task" => Ok(Self::PerTask),
            other => Err(ConfigError::UnknownFailurePolicy(other.to_owned())),
        }
    }
}

/// Scale factors and score values applied when building a bundle.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    pub similarity_scale: f64,
    pub grammar_scale: i64,
    /// Emotion score when Anger or Sad is among the two dominant labels.
    pub emotion_low: i64,
    pub emotion_high: i64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            similarity_scale: 10.0,
            grammar_scale: 2,
            emotion_low: 5,
            emotion_high: 10,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineSettings {
    pub workers: WorkerCount,
    pub frame_samples: FrameSamples,
    pub failure_policy: FailurePolicy,
    pub task_timeout: Option<Duration>,
    pub scoring: ScoringConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenAiConfig {
    #[serde(skip)]
    pub api_key: Option<ApiKey>,
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub transcription_model: String,
}

impl OpenAiConfig {
    /// Joins `path` onto the base url, keeping any path prefix such as `/v1`.
    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        join_endpoint(&parse_url(&self.base_url)?, path)
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_OPENAI_BASE_URL.to_owned(),
            chat_model: DEFAULT_CHAT_MODEL.to_owned(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_owned(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_owned(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassifierConfig {
    pub endpoint: String,
}

impl ClassifierConfig {
    pub fn url(&self) -> Result<Url, ConfigError> {
        parse_url(&self.endpoint)
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CLASSIFIER_URL.to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriberConfig {
    /// Local whisper.cpp model. When unset, audio goes to the OpenAI API.
    pub whisper_model_path: Option<String>,
    pub language: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub openai: OpenAiConfig,
    pub classifier: ClassifierConfig,
    pub transcriber: TranscriberConfig,
    pub pipeline: PipelineSettings,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("api key must not be empty")]
    EmptyApiKey,
    #[error("worker count must be > 0")]
    ZeroWorkers,
    #[error("frame sample count must be > 0")]
    ZeroFrameSamples,
    #[error("unknown failure policy: {0} (expected all-or-nothing or per-task)")]
    UnknownFailurePolicy(String),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

pub fn resolve_api_key(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Result<Option<ApiKey>, ConfigError> {
    match cli_value {
        Some(v) => Ok(Some(ApiKey::new(v)?)),
        None => match env.var(env_key) {
            Some(v) => Ok(Some(ApiKey::new(v)?)),
            None => Ok(None),
        },
    }
}

pub fn resolve_string_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> String {
    match cli_value {
        Some(v) => v,
        None => env.var(env_key).unwrap_or_else(|| default.to_owned()),
    }
}

pub fn resolve_optional_string(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Option<String> {
    match cli_value {
        Some(v) => Some(v),
        None => env.var(env_key),
    }
}

/// Like [`resolve_string_with_default`], but the result must parse as a url.
pub fn resolve_url_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> Result<String, ConfigError> {
    let raw = resolve_string_with_default(cli_value, env_key, env, default);
    parse_url(&raw)?;
    Ok(raw)
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_owned(),
        reason: e.to_string(),
    })
}

fn join_endpoint(base: &Url, path: &str) -> Result<Url, ConfigError> {
    let mut joined = base.clone();
    let trimmed = base.path().trim_end_matches('/');
    joined.set_path(&format!("{trimmed}/{}", path.trim_start_matches('/')));
    if joined.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl {
            url: base.to_string(),
            reason: "url cannot be a base".to_owned(),
        });
    }
    Ok(joined)
}
