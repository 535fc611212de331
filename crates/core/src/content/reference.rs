use crate::llm::{ChatMessage, ChatPrompt, GenerateError, TextGenerator};
use std::sync::Arc;
use std::time::Instant;

pub fn reference_prompt(topic: &str) -> ChatPrompt {
    ChatPrompt {
        messages: vec![ChatMessage::user(format!(
            "Write a short description about {topic}."
        ))],
        temperature: 1.0,
        max_tokens: 256,
    }
}

/// Produces the text a presentation on a topic is compared against.
#[derive(Clone)]
pub struct ReferenceGenerator {
    generator: Arc<dyn TextGenerator>,
}

impl ReferenceGenerator {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub async fn generate(&self, topic: &str) -> Result<String, GenerateError> {
        let started = Instant::now();
        tracing::info!(topic, "generating reference content");
        let text = self.generator.generate(reference_prompt(topic)).await?;
        if text.trim().is_empty() {
            return Err(GenerateError::InvalidResponse(
                "empty reference content".to_owned(),
            ));
        }
        tracing::info!(
            chars = text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reference content generated"
        );
        Ok(text)
    }
}
