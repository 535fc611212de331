use crate::config::{ClassifierConfig, ConfigError};
use crate::emotion::EmotionLabel;
use crate::media::Frame;
use crate::util::{is_http_retryable, retry_with_backoff, RetryConfig};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum ClassifyError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("classifier error: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid classifier response: {0}")]
    InvalidResponse(String),
}

/// Classifies the dominant facial emotion in a single frame.
pub trait FrameClassifier: Send + Sync {
    fn classify(&self, frame: Frame) -> BoxFuture<'_, Result<EmotionLabel, ClassifyError>>;
}

/// Sends PNG frames to an emotion inference service.
///
/// The service answers `{"label": "<Surprise|Neutral|Anger|Happy|Sad>"}` and
/// is expected to report `Neutral` when no face is found.
#[derive(Clone)]
pub struct RemoteFrameClassifier {
    client: Client,
    url: Url,
    retry: RetryConfig,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    label: String,
}

impl RemoteFrameClassifier {
    pub fn new(client: Client, config: &ClassifierConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            url: config.url()?,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn send(&self, frame: &Frame) -> Result<EmotionLabel, ClassifyError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(frame.png.clone())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClassifyError::Api { status, body });
        }

        let parsed: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| ClassifyError::InvalidResponse(format!("Failed to parse JSON: {e}")))?;
        parse_label(&parsed.label)
    }
}

fn parse_label(raw: &str) -> Result<EmotionLabel, ClassifyError> {
    raw.parse()
        .map_err(|e: crate::emotion::UnknownLabel| ClassifyError::InvalidResponse(e.to_string()))
}

fn is_retryable(err: &ClassifyError) -> bool {
    match err {
        ClassifyError::Api { status, .. } => is_http_retryable(*status),
        ClassifyError::Network(e) => e.is_timeout() || e.is_connect(),
        ClassifyError::InvalidResponse(_) => false,
    }
}

impl FrameClassifier for RemoteFrameClassifier {
    fn classify(&self, frame: Frame) -> BoxFuture<'_, Result<EmotionLabel, ClassifyError>> {
        async move {
            let label = retry_with_backoff(&self.retry, || self.send(&frame), is_retryable).await?;
            tracing::trace!(frame = frame.index, %label, "frame classified");
            Ok(label)
        }
        .boxed()
    }
}
