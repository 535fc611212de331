mod openai;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub use openai::OpenAiChatClient;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system<S: Into<String>>(content: S) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A complete request to a text-generation service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatPrompt {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum GenerateError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("text generation api error: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: ChatPrompt) -> BoxFuture<'_, Result<String, GenerateError>>;
}
