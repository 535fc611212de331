mod openai;
#[cfg(feature = "whisper")]
mod whisper;

use crate::media::AudioTrack;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use openai::OpenAiTranscriber;
#[cfg(feature = "whisper")]
pub use whisper::WhisperTranscriber;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub audio_duration: Duration,
}

impl Transcript {
    /// True when no speech was recognised.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TranscribeError {
    #[error("unsupported audio: {0}")]
    UnsupportedAudio(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("transcription api error: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub trait Transcriber: Send + Sync {
    fn transcribe(&self, audio: Arc<AudioTrack>) -> BoxFuture<'_, Result<Transcript, TranscribeError>>;
}
