use crate::config::{ApiKey, ConfigError, OpenAiConfig};
use crate::llm::{ChatMessage, ChatPrompt, GenerateError, TextGenerator};
use crate::util::{is_http_retryable, retry_with_backoff, RetryConfig};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

/// Chat completions client for OpenAI-compatible servers.
#[derive(Clone)]
pub struct OpenAiChatClient {
    client: Client,
    api_key: ApiKey,
    url: Url,
    model: String,
    retry: RetryConfig,
}

impl OpenAiChatClient {
    pub fn new(client: Client, api_key: ApiKey, config: &OpenAiConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            api_key,
            url: config.endpoint("chat/completions")?,
            model: config.chat_model.clone(),
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<String, GenerateError> {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(self.api_key.expose())
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GenerateError::Api { status, body });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerateError::InvalidResponse(format!("Failed to parse JSON: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerateError::InvalidResponse("No choices in response".to_string()))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

fn is_retryable(err: &GenerateError) -> bool {
    match err {
        GenerateError::Api { status, .. } => is_http_retryable(*status),
        GenerateError::Network(e) => e.is_timeout() || e.is_connect(),
        _ => false,
    }
}

impl TextGenerator for OpenAiChatClient {
    fn generate(&self, prompt: ChatPrompt) -> BoxFuture<'_, Result<String, GenerateError>> {
        async move {
            let request = ChatRequest {
                model: &self.model,
                messages: &prompt.messages,
                temperature: prompt.temperature,
                max_tokens: prompt.max_tokens,
                top_p: 1.0,
                frequency_penalty: 0.0,
                presence_penalty: 0.0,
            };
            retry_with_backoff(&self.retry, || self.send(&request), is_retryable).await
        }
        .boxed()
    }
}
