use crate::config::{ApiKey, ConfigError, OpenAiConfig};
use crate::util::{is_http_retryable, retry_with_backoff, RetryConfig};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum SimilarityError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("embedding api error: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("embedding dimensions differ: {0} vs {1}")]
    DimensionMismatch(usize, usize),
}

/// Turns texts into dense vectors, one per input, in input order.
pub trait Embedder: Send + Sync {
    fn embed(&self, texts: Vec<String>) -> BoxFuture<'_, Result<Vec<Vec<f32>>, SimilarityError>>;
}

pub trait SimilarityScorer: Send + Sync {
    /// Similarity of two texts in `[-1, 1]`.
    fn similarity(&self, a: String, b: String) -> BoxFuture<'_, Result<f32, SimilarityError>>;
}

/// Cosine of the angle between two vectors. Zero vectors have similarity 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch(a.len(), b.len()));
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32)
}

/// Cosine similarity over embeddings from any [`Embedder`].
pub struct EmbeddingSimilarity<E> {
    embedder: E,
}

impl<E: Embedder> EmbeddingSimilarity<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }
}

impl<E: Embedder> SimilarityScorer for EmbeddingSimilarity<E> {
    fn similarity(&self, a: String, b: String) -> BoxFuture<'_, Result<f32, SimilarityError>> {
        async move {
            let started = Instant::now();
            let vectors = self.embedder.embed(vec![a, b]).await?;
            let [va, vb] = vectors.as_slice() else {
                return Err(SimilarityError::InvalidResponse(format!(
                    "expected 2 embeddings, got {}",
                    vectors.len()
                )));
            };
            let score = cosine_similarity(va, vb)?;
            tracing::info!(
                similarity = score,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "content comparison finished"
            );
            Ok(score)
        }
        .boxed()
    }
}

/// Sentence embeddings from an OpenAI-compatible `/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    api_key: ApiKey,
    url: Url,
    model: String,
    retry: RetryConfig,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(client: Client, api_key: ApiKey, config: &OpenAiConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            api_key,
            url: config.endpoint("embeddings")?,
            model: config.embedding_model.clone(),
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn send(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SimilarityError> {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(self.api_key.expose())
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SimilarityError::Api { status, body });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            SimilarityError::InvalidResponse(format!("Failed to parse JSON: {e}"))
        })?;
        order_embeddings(parsed, texts.len())
    }
}

fn order_embeddings(
    response: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, SimilarityError> {
    let mut data = response.data;
    if data.len() != expected {
        return Err(SimilarityError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

fn is_retryable(err: &SimilarityError) -> bool {
    match err {
        SimilarityError::Api { status, .. } => is_http_retryable(*status),
        SimilarityError::Network(e) => e.is_timeout() || e.is_connect(),
        _ => false,
    }
}

impl Embedder for OpenAiEmbedder {
    fn embed(&self, texts: Vec<String>) -> BoxFuture<'_, Result<Vec<Vec<f32>>, SimilarityError>> {
        async move { retry_with_backoff(&self.retry, || self.send(&texts), is_retryable).await }
            .boxed()
    }
}
