use crate::media::{AudioTrack, ANALYSIS_SAMPLE_RATE};
use crate::transcribe::{TranscribeError, Transcriber, Transcript};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Instant;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Local whisper.cpp transcription. The model is loaded once and shared.
#[derive(Clone)]
pub struct WhisperTranscriber {
    context: Arc<WhisperContext>,
    language: String,
}

impl WhisperTranscriber {
    pub fn new(model_path: &str, language: Option<String>) -> Result<Self, TranscribeError> {
        let context =
            WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                .map_err(|e| TranscribeError::Model(format!("{model_path}: {e}")))?;
        tracing::info!(model = model_path, "whisper model loaded");
        Ok(Self {
            context: Arc::new(context),
            language: language.unwrap_or_else(|| "en".to_owned()),
        })
    }

    fn run(
        context: &WhisperContext,
        language: &str,
        audio: &AudioTrack,
    ) -> Result<String, TranscribeError> {
        if audio.sample_rate != ANALYSIS_SAMPLE_RATE {
            return Err(TranscribeError::UnsupportedAudio(format!(
                "whisper expects {ANALYSIS_SAMPLE_RATE} Hz, got {}",
                audio.sample_rate
            )));
        }

        let mut state = context
            .create_state()
            .map_err(|e| TranscribeError::Model(e.to_string()))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(language));
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_special(false);
        params.set_print_timestamps(false);

        state
            .full(params, &audio.samples)
            .map_err(|e| TranscribeError::Model(e.to_string()))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            let piece = segment
                .to_str_lossy()
                .map_err(|e| TranscribeError::Model(e.to_string()))?;
            text.push_str(&piece);
        }
        Ok(text.trim().to_owned())
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(
        &self,
        audio: Arc<AudioTrack>,
    ) -> BoxFuture<'_, Result<Transcript, TranscribeError>> {
        let context = Arc::clone(&self.context);
        let language = self.language.clone();
        async move {
            let started = Instant::now();
            let audio_duration = audio.duration();
            let text = tokio::task::spawn_blocking(move || Self::run(&context, &language, &audio))
                .await
                .map_err(|e| TranscribeError::Model(format!("whisper task failed: {e}")))??;
            tracing::info!(
                chars = text.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "transcription finished"
            );
            Ok(Transcript {
                text,
                audio_duration,
            })
        }
        .boxed()
    }
}
