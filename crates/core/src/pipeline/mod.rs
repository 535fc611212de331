//! Scores one presentation video.
//!
//! The audio track is extracted first, then three tasks run concurrently on a
//! bounded worker pool: the audio task (transcript, similarity, grammar), the
//! video task (per-frame emotion) and the prosody task (vocal confidence).
//! All three are joined before their partial scores are merged.

use crate::config::{FailurePolicy, PipelineSettings, ScoringConfig};
use crate::content::{ReferenceGenerator, SimilarityError, SimilarityScorer};
use crate::emotion::{emotion_score, ClassifyError, EmotionTally, FrameClassifier};
use crate::grammar::GrammarScorer;
use crate::llm::{GenerateError, TextGenerator};
use crate::media::{
    sample_frames, AudioTrack, ExtractError, FrameError, FrameSource, MediaExtractor, VideoHandle,
};
use crate::prosody::{ProsodyAnalyzer, ProsodyError};
use crate::transcribe::{TranscribeError, Transcriber};
use futures::{FutureExt, StreamExt};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "pipeline";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub video: VideoHandle,
    pub topic: Option<String>,
}

impl AnalysisRequest {
    pub fn new(video: VideoHandle, topic: Option<String>) -> Self {
        Self { video, topic }
    }

    /// The topic, unless it is missing or blank.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

/// Final scores. Every field is present and non-negative.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreBundle {
    pub confidence: u32,
    pub similarity_score: u32,
    pub emotion_score: u32,
    pub grammar_score: u32,
}

/// Scores produced by one task before normalization. May be negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawScores {
    pub confidence: Option<i64>,
    pub similarity_score: Option<i64>,
    pub emotion_score: Option<i64>,
    pub grammar_score: Option<i64>,
}

impl RawScores {
    pub fn merge(self, other: RawScores) -> RawScores {
        RawScores {
            confidence: other.confidence.or(self.confidence),
            similarity_score: other.similarity_score.or(self.similarity_score),
            emotion_score: other.emotion_score.or(self.emotion_score),
            grammar_score: other.grammar_score.or(self.grammar_score),
        }
    }

    /// Missing and negative values become 0.
    pub fn normalize(self) -> ScoreBundle {
        fn clamp(v: Option<i64>) -> u32 {
            u32::try_from(v.unwrap_or(0).max(0)).unwrap_or(u32::MAX)
        }
        ScoreBundle {
            confidence: clamp(self.confidence),
            similarity_score: clamp(self.similarity_score),
            emotion_score: clamp(self.emotion_score),
            grammar_score: clamp(self.grammar_score),
        }
    }
}

/// Result of one analysis run.
///
/// Serializes as the bare bundle when scored, and as `{"message": <bundle>}`
/// with all scores zeroed when the run failed, so callers can tell a computed
/// zero from a failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Scored(ScoreBundle),
    Failed { bundle: ScoreBundle, reason: String },
}

impl AnalysisOutcome {
    pub fn failed(reason: String) -> Self {
        Self::Failed {
            bundle: ScoreBundle::default(),
            reason,
        }
    }

    pub fn bundle(&self) -> &ScoreBundle {
        match self {
            Self::Scored(bundle) | Self::Failed { bundle, .. } => bundle,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl Serialize for AnalysisOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Scored(bundle) => bundle.serialize(serializer),
            Self::Failed { bundle, .. } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("message", bundle)?;
                map.end()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Audio,
    Video,
    Prosody,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::Audio => "audio",
            TaskKind::Video => "video",
            TaskKind::Prosody => "prosody",
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    #[error("audio extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("no utterances found")]
    NoSpeech,

    #[error("transcription failed: {0}")]
    Transcription(#[from] TranscribeError),

    #[error("text generation failed: {0}")]
    Generation(#[from] GenerateError),

    #[error("content similarity failed: {0}")]
    Similarity(#[from] SimilarityError),

    #[error("frame sampling failed: {0}")]
    Frames(#[from] FrameError),

    #[error("frame classification failed: {0}")]
    Classification(#[from] ClassifyError),

    #[error("prosody analysis failed: {0}")]
    Prosody(#[from] ProsodyError),

    #[error("analysis timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0} task cancelled")]
    Cancelled(TaskKind),

    #[error("{0} task panicked: {1}")]
    TaskPanicked(TaskKind, String),
}

impl AnalysisError {
    /// Errors that fail the request under every failure policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AnalysisError::Extraction(_) | AnalysisError::NoSpeech)
    }

    fn is_cancellation(&self) -> bool {
        matches!(self, AnalysisError::Cancelled(_))
    }
}

/// Process-wide analysis collaborators, built once and shared by every run.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn MediaExtractor>,
    pub transcriber: Arc<dyn Transcriber>,
    pub frames: Arc<dyn FrameSource>,
    pub classifier: Arc<dyn FrameClassifier>,
    pub prosody: Arc<dyn ProsodyAnalyzer>,
    pub text: Arc<dyn TextGenerator>,
    pub similarity: Arc<dyn SimilarityScorer>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    collaborators: Collaborators,
    reference: ReferenceGenerator,
    grammar: GrammarScorer,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let reference = ReferenceGenerator::new(Arc::clone(&collaborators.text));
        let grammar = GrammarScorer::new(Arc::clone(&collaborators.text));
        Self {
            inner: Arc::new(Inner {
                collaborators,
                reference,
                grammar,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    /// Scores one video. Never fails: any error yields the zeroed, failed outcome.
    pub async fn run(&self, request: AnalysisRequest) -> AnalysisOutcome {
        let started = Instant::now();
        let video = request.video.path().display().to_string();

        let result = match self.inner.settings.task_timeout {
            Some(limit) => tokio::time::timeout(limit, self.analyze(&request))
                .await
                .unwrap_or(Err(AnalysisError::TimedOut(limit))),
            None => self.analyze(&request).await,
        };

        match result {
            Ok(raw) => {
                let bundle = raw.normalize();
                tracing::info!(
                    target: LOG_TARGET,
                    video,
                    confidence = bundle.confidence,
                    similarity_score = bundle.similarity_score,
                    emotion_score = bundle.emotion_score,
                    grammar_score = bundle.grammar_score,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "analysis finished"
                );
                AnalysisOutcome::Scored(bundle)
            }
            Err(e) => {
                tracing::error!(
                    target: LOG_TARGET,
                    video,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "analysis failed, returning zeroed scores"
                );
                AnalysisOutcome::failed(e.to_string())
            }
        }
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<RawScores, AnalysisError> {
        let audio = Arc::new(
            self.inner
                .collaborators
                .extractor
                .extract_audio(request.video.clone())
                .await?,
        );

        let cancel = CancellationToken::new();
        // Dropping this future (e.g. on timeout) stops the spawned tasks.
        let _stop_on_drop = cancel.clone().drop_guard();
        let workers = Arc::new(Semaphore::new(self.inner.settings.workers.get()));

        let audio_task = {
            let this = self.clone();
            let audio = Arc::clone(&audio);
            let topic = request.topic().map(str::to_owned);
            self.spawn_task(TaskKind::Audio, &workers, &cancel, async move {
                this.audio_task(audio, topic).await
            })
        };
        let video_task = {
            let this = self.clone();
            let video = request.video.clone();
            self.spawn_task(TaskKind::Video, &workers, &cancel, async move {
                this.video_task(video).await
            })
        };
        let prosody_task = {
            let this = self.clone();
            let audio = Arc::clone(&audio);
            self.spawn_task(TaskKind::Prosody, &workers, &cancel, async move {
                this.prosody_task(audio).await
            })
        };

        let (audio, video, prosody) = tokio::join!(audio_task, video_task, prosody_task);
        let results = [
            (TaskKind::Audio, flatten(TaskKind::Audio, audio)),
            (TaskKind::Video, flatten(TaskKind::Video, video)),
            (TaskKind::Prosody, flatten(TaskKind::Prosody, prosody)),
        ];
        self.aggregate(results)
    }

    fn spawn_task<F>(
        &self,
        kind: TaskKind,
        workers: &Arc<Semaphore>,
        cancel: &CancellationToken,
        task: F,
    ) -> JoinHandle<Result<RawScores, AnalysisError>>
    where
        F: Future<Output = Result<RawScores, AnalysisError>> + Send + 'static,
    {
        let workers = Arc::clone(workers);
        let cancel = cancel.clone();
        let policy = self.inner.settings.failure_policy;

        tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AnalysisError::Cancelled(kind)),
                permit = workers.acquire_owned() => {
                    permit.map_err(|_| AnalysisError::Cancelled(kind))?
                }
            };

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AnalysisError::Cancelled(kind)),
                result = AssertUnwindSafe(task).catch_unwind() => result.unwrap_or_else(|panic| {
                    Err(AnalysisError::TaskPanicked(kind, panic_message(panic.as_ref())))
                }),
            };

            match &result {
                Ok(_) => tracing::debug!(
                    target: LOG_TARGET,
                    task = %kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task finished"
                ),
                Err(e) if e.is_cancellation() => {
                    tracing::debug!(target: LOG_TARGET, task = %kind, "task cancelled")
                }
                Err(e) => {
                    tracing::warn!(target: LOG_TARGET, task = %kind, error = %e, "task failed");
                    if policy == FailurePolicy::AllOrNothing || e.is_fatal() {
                        cancel.cancel();
                    }
                }
            }
            result
        })
    }

    fn aggregate(
        &self,
        results: [(TaskKind, Result<RawScores, AnalysisError>); 3],
    ) -> Result<RawScores, AnalysisError> {
        let mut merged = RawScores::default();
        let mut first_error: Option<AnalysisError> = None;

        for (kind, result) in results {
            match result {
                Ok(scores) => merged = merged.merge(scores),
                Err(e) => {
                    let keep_going = self.inner.settings.failure_policy == FailurePolicy::PerTask
                        && !e.is_fatal()
                        && !e.is_cancellation();
                    if keep_going {
                        tracing::warn!(
                            target: LOG_TARGET,
                            task = %kind,
                            error = %e,
                            "task failed, its scores default to 0"
                        );
                        continue;
                    }
                    // Report the root cause rather than a sibling's cancellation.
                    first_error = match first_error {
                        Some(prev) if !prev.is_cancellation() || e.is_cancellation() => Some(prev),
                        _ => Some(e),
                    };
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(merged),
        }
    }

    async fn audio_task(
        &self,
        audio: Arc<AudioTrack>,
        topic: Option<String>,
    ) -> Result<RawScores, AnalysisError> {
        let inner = &self.inner;
        let transcript = inner.collaborators.transcriber.transcribe(audio).await?;
        if transcript.is_empty() {
            return Err(AnalysisError::NoSpeech);
        }
        let text = transcript.text;
        let scoring = inner.settings.scoring;

        let similarity = async {
            let Some(topic) = topic.as_deref() else {
                return Ok::<_, AnalysisError>(0);
            };
            let reference = inner.reference.generate(topic).await?;
            let similarity = inner
                .collaborators
                .similarity
                .similarity(text.clone(), reference)
                .await?;
            Ok(scale_similarity(similarity, &scoring))
        };
        let grammar = async {
            let score = inner.grammar.score(&text).await?;
            Ok::<_, AnalysisError>(i64::from(score) * scoring.grammar_scale)
        };

        let (similarity_score, grammar_score) = tokio::try_join!(similarity, grammar)?;
        Ok(RawScores {
            similarity_score: Some(similarity_score),
            grammar_score: Some(grammar_score),
            ..RawScores::default()
        })
    }

    async fn video_task(&self, video: VideoHandle) -> Result<RawScores, AnalysisError> {
        let inner = &self.inner;
        let started = Instant::now();
        let mut frames = sample_frames(
            inner.collaborators.frames.as_ref(),
            video,
            inner.settings.frame_samples.get(),
        );

        let mut tally = EmotionTally::new();
        while let Some(frame) = frames.next().await {
            let label = inner.collaborators.classifier.classify(frame?).await?;
            tally.record(label);
        }

        let score = emotion_score(&tally, &inner.settings.scoring);
        tracing::info!(
            target: LOG_TARGET,
            frames = tally.total(),
            dominant = ?tally.dominant(2),
            emotion_score = score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "emotion score calculated"
        );
        Ok(RawScores {
            emotion_score: Some(score),
            ..RawScores::default()
        })
    }

    async fn prosody_task(&self, audio: Arc<AudioTrack>) -> Result<RawScores, AnalysisError> {
        let confidence = self.inner.collaborators.prosody.analyze(audio).await?;
        Ok(RawScores {
            confidence: Some(confidence),
            ..RawScores::default()
        })
    }
}

/// `round(similarity * scale)`, rounding halves to even.
pub fn scale_similarity(similarity: f32, scoring: &ScoringConfig) -> i64 {
    (f64::from(similarity) * scoring.similarity_scale).round_ties_even() as i64
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

fn flatten(
    kind: TaskKind,
    joined: Result<Result<RawScores, AnalysisError>, tokio::task::JoinError>,
) -> Result<RawScores, AnalysisError> {
    joined.unwrap_or_else(|e| Err(AnalysisError::TaskPanicked(kind, e.to_string())))
}

#[cfg(test)]
mod tests;
