use super::*;
use crate::config::{FrameSamples, WorkerCount};
use crate::emotion::EmotionLabel;
use crate::llm::{ChatPrompt, Role};
use crate::media::{Frame, VideoInfo};
use crate::transcribe::Transcript;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Tracks how many task bodies run at the same time.
#[derive(Default)]
struct Activity {
    hold: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl Activity {
    fn holding(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            ..Self::default()
        })
    }

    async fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeExtractor {
    fail: bool,
}

impl MediaExtractor for FakeExtractor {
    fn extract_audio(&self, video: VideoHandle) -> BoxFuture<'_, crate::media::Result<AudioTrack>> {
        let fail = self.fail;
        async move {
            if fail {
                return Err(ExtractError::NoAudio(video.path().to_path_buf()));
            }
            Ok(AudioTrack::new(16_000, vec![0.0; 16_000]))
        }
        .boxed()
    }
}

struct FakeTranscriber {
    text: &'static str,
    activity: Arc<Activity>,
}

impl Transcriber for FakeTranscriber {
    fn transcribe(
        &self,
        audio: Arc<AudioTrack>,
    ) -> BoxFuture<'_, Result<Transcript, TranscribeError>> {
        let text = self.text.to_owned();
        async move {
            self.activity.enter().await;
            Ok(Transcript {
                text,
                audio_duration: audio.duration(),
            })
        }
        .boxed()
    }
}

struct FakeFrames {
    frame_count: u64,
    activity: Arc<Activity>,
}

impl FrameSource for FakeFrames {
    fn probe(&self, _video: VideoHandle) -> BoxFuture<'_, Result<VideoInfo, FrameError>> {
        let frame_count = self.frame_count;
        async move {
            self.activity.enter().await;
            Ok(VideoInfo {
                frame_count,
                frame_rate: 30.0,
            })
        }
        .boxed()
    }

    fn read_frame(
        &self,
        _video: VideoHandle,
        _info: VideoInfo,
        index: u64,
    ) -> BoxFuture<'_, Result<Frame, FrameError>> {
        async move {
            Ok(Frame {
                index,
                png: Bytes::new(),
            })
        }
        .boxed()
    }
}

struct FakeClassifier {
    label: Option<EmotionLabel>,
}

impl FrameClassifier for FakeClassifier {
    fn classify(&self, _frame: Frame) -> BoxFuture<'_, Result<EmotionLabel, ClassifyError>> {
        let label = self.label;
        async move { label.ok_or_else(|| ClassifyError::InvalidResponse("no face".to_owned())) }
            .boxed()
    }
}

#[derive(Default)]
struct FakeProsody {
    delay: Option<Duration>,
    panic: bool,
    finished: Arc<AtomicBool>,
    activity: Arc<Activity>,
}

impl ProsodyAnalyzer for FakeProsody {
    fn analyze(&self, _audio: Arc<AudioTrack>) -> BoxFuture<'_, Result<i64, ProsodyError>> {
        async move {
            if self.panic {
                panic!("prosody blew up");
            }
            self.activity.enter().await;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.finished.store(true, Ordering::SeqCst);
            Ok(80)
        }
        .boxed()
    }
}

/// Answers grammar prompts (which carry a system rubric) with `grammar` and
/// anything else with a reference description.
struct FakeText {
    grammar: &'static str,
    reference_calls: Arc<AtomicUsize>,
}

impl TextGenerator for FakeText {
    fn generate(&self, prompt: ChatPrompt) -> BoxFuture<'_, Result<String, GenerateError>> {
        async move {
            if prompt.messages.first().map(|m| m.role) == Some(Role::System) {
                Ok(self.grammar.to_owned())
            } else {
                self.reference_calls.fetch_add(1, Ordering::SeqCst);
                Ok("A talk about renewable energy.".to_owned())
            }
        }
        .boxed()
    }
}

struct FakeSimilarity(f32);

impl SimilarityScorer for FakeSimilarity {
    fn similarity(&self, _a: String, _b: String) -> BoxFuture<'_, Result<f32, SimilarityError>> {
        let value = self.0;
        async move { Ok(value) }.boxed()
    }
}

struct Harness {
    extract_fails: bool,
    transcript: &'static str,
    label: Option<EmotionLabel>,
    prosody: FakeProsody,
    grammar: &'static str,
    similarity: f32,
    settings: PipelineSettings,
    reference_calls: Arc<AtomicUsize>,
    activity: Arc<Activity>,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            extract_fails: false,
            transcript: "solar and wind power are getting cheaper every year",
            label: Some(EmotionLabel::Happy),
            prosody: FakeProsody::default(),
            grammar: "Score: 4 out of 5",
            similarity: 0.73,
            settings: PipelineSettings::default(),
            reference_calls: Arc::new(AtomicUsize::new(0)),
            activity: Arc::new(Activity::default()),
        }
    }
}

impl Harness {
    fn build(self) -> Orchestrator {
        let prosody = FakeProsody {
            activity: Arc::clone(&self.activity),
            ..self.prosody
        };
        let collaborators = Collaborators {
            extractor: Arc::new(FakeExtractor {
                fail: self.extract_fails,
            }),
            transcriber: Arc::new(FakeTranscriber {
                text: self.transcript,
                activity: Arc::clone(&self.activity),
            }),
            frames: Arc::new(FakeFrames {
                frame_count: 1000,
                activity: Arc::clone(&self.activity),
            }),
            classifier: Arc::new(FakeClassifier { label: self.label }),
            prosody: Arc::new(prosody),
            text: Arc::new(FakeText {
                grammar: self.grammar,
                reference_calls: self.reference_calls,
            }),
            similarity: Arc::new(FakeSimilarity(self.similarity)),
        };
        Orchestrator::new(collaborators, self.settings)
    }
}

fn request(topic: Option<&str>) -> AnalysisRequest {
    AnalysisRequest::new(VideoHandle::new("talk.mp4"), topic.map(str::to_owned))
}

fn scored(confidence: u32, similarity: u32, emotion: u32, grammar: u32) -> AnalysisOutcome {
    AnalysisOutcome::Scored(ScoreBundle {
        confidence,
        similarity_score: similarity,
        emotion_score: emotion,
        grammar_score: grammar,
    })
}

#[tokio::test]
async fn successful_run_combines_all_tasks() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = Harness {
        reference_calls: Arc::clone(&calls),
        ..Harness::default()
    }
    .build();

    let outcome = orchestrator.run(request(Some("renewable energy"))).await;
    assert_eq!(outcome, scored(80, 7, 10, 8));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_topic_skips_reference_and_scores_zero_similarity() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = Harness {
        reference_calls: Arc::clone(&calls),
        ..Harness::default()
    }
    .build();

    assert_eq!(orchestrator.run(request(None)).await, scored(80, 0, 10, 8));
    assert_eq!(orchestrator.run(request(Some("   "))).await, scored(80, 0, 10, 8));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn negative_similarity_is_clamped_to_zero() {
    let orchestrator = Harness {
        similarity: -0.2,
        ..Harness::default()
    }
    .build();
    let outcome = orchestrator.run(request(Some("cooking"))).await;
    assert_eq!(outcome.bundle().similarity_score, 0);
    assert!(!outcome.is_failed());
}

#[tokio::test]
async fn negative_emotion_lowers_emotion_score() {
    let orchestrator = Harness {
        label: Some(EmotionLabel::Sad),
        ..Harness::default()
    }
    .build();
    let outcome = orchestrator.run(request(Some("renewable energy"))).await;
    assert_eq!(outcome.bundle().emotion_score, 5);
}

#[tokio::test]
async fn extraction_failure_returns_zeroed_failure() {
    let orchestrator = Harness {
        extract_fails: true,
        ..Harness::default()
    }
    .build();
    let outcome = orchestrator.run(request(Some("renewable energy"))).await;
    assert!(outcome.is_failed());
    assert_eq!(*outcome.bundle(), ScoreBundle::default());
}

#[tokio::test]
async fn empty_transcript_fails_the_request() {
    let orchestrator = Harness {
        transcript: "  ",
        ..Harness::default()
    }
    .build();
    match orchestrator.run(request(Some("renewable energy"))).await {
        AnalysisOutcome::Failed { bundle, reason } => {
            assert_eq!(bundle, ScoreBundle::default());
            assert!(reason.contains("no utterances"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn grammar_reply_without_digit_fails_the_request() {
    let orchestrator = Harness {
        grammar: "very good",
        ..Harness::default()
    }
    .build();
    assert!(orchestrator.run(request(None)).await.is_failed());
}

#[tokio::test(start_paused = true)]
async fn slow_task_does_not_change_scores() {
    let orchestrator = Harness {
        prosody: FakeProsody {
            delay: Some(Duration::from_secs(30)),
            ..FakeProsody::default()
        },
        ..Harness::default()
    }
    .build();
    let outcome = orchestrator.run(request(Some("renewable energy"))).await;
    assert_eq!(outcome, scored(80, 7, 10, 8));
}

async fn peak_parallelism(workers: usize) -> usize {
    let activity = Activity::holding(Duration::from_secs(1));
    let orchestrator = Harness {
        settings: PipelineSettings {
            workers: WorkerCount::new(workers).unwrap(),
            frame_samples: FrameSamples::new(10).unwrap(),
            ..PipelineSettings::default()
        },
        activity: Arc::clone(&activity),
        ..Harness::default()
    }
    .build();
    let outcome = orchestrator.run(request(Some("renewable energy"))).await;
    assert_eq!(outcome, scored(80, 7, 10, 8));
    assert_eq!(activity.completed.load(Ordering::SeqCst), 3);
    activity.peak.load(Ordering::SeqCst)
}

#[tokio::test(start_paused = true)]
async fn worker_count_bounds_running_tasks() {
    assert_eq!(peak_parallelism(1).await, 1);
    assert_eq!(peak_parallelism(2).await, 2);
    assert_eq!(peak_parallelism(3).await, 3);
}

#[tokio::test(start_paused = true)]
async fn failure_cancels_sibling_tasks() {
    let finished = Arc::new(AtomicBool::new(false));
    let orchestrator = Harness {
        transcript: "",
        prosody: FakeProsody {
            delay: Some(Duration::from_secs(3600)),
            finished: Arc::clone(&finished),
            ..FakeProsody::default()
        },
        ..Harness::default()
    }
    .build();

    let outcome = orchestrator.run(request(None)).await;
    match outcome {
        AnalysisOutcome::Failed { reason, .. } => {
            assert!(reason.contains("no utterances"), "{reason}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn timeout_fails_the_request() {
    let finished = Arc::new(AtomicBool::new(false));
    let orchestrator = Harness {
        prosody: FakeProsody {
            delay: Some(Duration::from_secs(10)),
            finished: Arc::clone(&finished),
            ..FakeProsody::default()
        },
        settings: PipelineSettings {
            task_timeout: Some(Duration::from_secs(1)),
            ..PipelineSettings::default()
        },
        ..Harness::default()
    }
    .build();

    match orchestrator.run(request(None)).await {
        AnalysisOutcome::Failed { bundle, reason } => {
            assert_eq!(bundle, ScoreBundle::default());
            assert!(reason.contains("timed out"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn panicking_task_fails_the_request_and_cancels_siblings() {
    let activity = Activity::holding(Duration::from_secs(60));
    let orchestrator = Harness {
        prosody: FakeProsody {
            panic: true,
            ..FakeProsody::default()
        },
        activity: Arc::clone(&activity),
        ..Harness::default()
    }
    .build();
    match orchestrator.run(request(None)).await {
        AnalysisOutcome::Failed { reason, .. } => {
            assert!(reason.contains("prosody task panicked: prosody blew up"), "{reason}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(activity.completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn per_task_policy_zeroes_only_the_failed_task() {
    let orchestrator = Harness {
        label: None,
        settings: PipelineSettings {
            failure_policy: FailurePolicy::PerTask,
            ..PipelineSettings::default()
        },
        ..Harness::default()
    }
    .build();
    let outcome = orchestrator.run(request(Some("renewable energy"))).await;
    assert_eq!(outcome, scored(80, 7, 0, 8));
}

#[tokio::test]
async fn per_task_policy_still_fails_without_speech() {
    let orchestrator = Harness {
        transcript: "",
        settings: PipelineSettings {
            failure_policy: FailurePolicy::PerTask,
            ..PipelineSettings::default()
        },
        ..Harness::default()
    }
    .build();
    assert!(orchestrator.run(request(None)).await.is_failed());
}

#[test]
fn outcomes_serialize_with_failure_marker() {
    let ok = scored(80, 7, 10, 8);
    assert_eq!(
        serde_json::to_value(&ok).unwrap(),
        serde_json::json!({
            "confidence": 80,
            "similarity_score": 7,
            "emotion_score": 10,
            "grammar_score": 8
        })
    );

    let failed = AnalysisOutcome::failed("boom".to_owned());
    assert_eq!(
        serde_json::to_value(&failed).unwrap(),
        serde_json::json!({
            "message": {
                "confidence": 0,
                "similarity_score": 0,
                "emotion_score": 0,
                "grammar_score": 0
            }
        })
    );
}

#[test]
fn similarity_scaling_rounds_half_to_even() {
    let scoring = ScoringConfig::default();
    assert_eq!(scale_similarity(0.73, &scoring), 7);
    assert_eq!(scale_similarity(-0.2, &scoring), -2);
    assert_eq!(scale_similarity(0.25, &scoring), 2);
    assert_eq!(scale_similarity(1.0, &scoring), 10);
}

#[test]
fn raw_scores_merge_and_clamp() {
    let merged = RawScores {
        confidence: Some(55),
        ..RawScores::default()
    }
    .merge(RawScores {
        similarity_score: Some(-3),
        grammar_score: Some(6),
        ..RawScores::default()
    });
    assert_eq!(
        merged.normalize(),
        ScoreBundle {
            confidence: 55,
            similarity_score: 0,
            emotion_score: 0,
            grammar_score: 6,
        }
    );
}
