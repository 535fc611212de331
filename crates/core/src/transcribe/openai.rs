use crate::config::{ApiKey, ConfigError, OpenAiConfig};
use crate::media::{encode_wav, AudioTrack};
use crate::transcribe::{TranscribeError, Transcriber, Transcript};
use crate::util::{is_http_retryable, retry_with_backoff, RetryConfig};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Upload size limit of `/audio/transcriptions`.
#[allow(dead_code)] // referenced by tests and docs only
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
/// 16 kHz 16-bit mono WAV pieces of this length stay well under [`MAX_UPLOAD_BYTES`].
pub const DEFAULT_MAX_CHUNK: Duration = Duration::from_secs(10 * 60);

/// Speech to text through the OpenAI `/audio/transcriptions` endpoint.
///
/// Long tracks are uploaded in consecutive pieces and the texts are joined.
#[derive(Clone)]
pub struct OpenAiTranscriber {
    client: Client,
    api_key: ApiKey,
    url: Url,
    model: String,
    language: Option<String>,
    retry: RetryConfig,
    max_chunk: Duration,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAiTranscriber {
    pub fn new(
        client: Client,
        api_key: ApiKey,
        config: &OpenAiConfig,
        language: Option<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            api_key,
            url: config.endpoint("audio/transcriptions")?,
            model: config.transcription_model.clone(),
            language,
            retry: RetryConfig::default(),
            max_chunk: DEFAULT_MAX_CHUNK,
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_chunk(mut self, max_chunk: Duration) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    async fn send(&self, wav: Vec<u8>) -> Result<String, TranscribeError> {
        let file = Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", file);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(self.api_key.expose())
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TranscribeError::Api { status, body });
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TranscribeError::InvalidResponse(format!("Failed to parse JSON: {e}")))?;
        Ok(parsed.text)
    }
}

fn join_transcripts(texts: &[String]) -> String {
    texts
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_retryable(err: &TranscribeError) -> bool {
    match err {
        TranscribeError::Api { status, .. } => is_http_retryable(*status),
        TranscribeError::Network(e) => e.is_timeout() || e.is_connect(),
        _ => false,
    }
}

impl Transcriber for OpenAiTranscriber {
    fn transcribe(
        &self,
        audio: Arc<AudioTrack>,
    ) -> BoxFuture<'_, Result<Transcript, TranscribeError>> {
        async move {
            let started = Instant::now();
            let pieces = audio.split(self.max_chunk);
            let mut texts = Vec::with_capacity(pieces.len());
            for piece in &pieces {
                let wav =
                    encode_wav(piece).map_err(|e| TranscribeError::UnsupportedAudio(e.to_string()))?;
                texts.push(retry_with_backoff(&self.retry, || self.send(wav.clone()), is_retryable).await?);
            }
            let text = join_transcripts(&texts);
            tracing::info!(
                chars = text.len(),
                pieces = pieces.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "transcription finished"
            );
            Ok(Transcript {
                text,
                audio_duration: audio.duration(),
            })
        }
        .boxed()
    }
}
