//! Grammar quality scoring through a text-generation rubric.

use crate::llm::{ChatMessage, ChatPrompt, GenerateError, TextGenerator};
use std::sync::Arc;
use std::time::Instant;

/// Highest score the rubric allows.
pub const MAX_GRAMMAR_SCORE: u8 = 5;

const RUBRIC: &str = "You are a english teacher who score a text from 0 to 5 based on the following criteria.
**0 - Poor**: Text contains numerous grammatical errors, making it difficult to comprehend. Errors may include incorrect word usage, subject-verb agreement issues, or inconsistent tense usage.
**1 - Below Average**: Text has several grammatical errors that hinder understanding. Errors are noticeable and distract from the overall message. Basic grammatical structures may be incorrectly used.
**2 - Average**: Text generally follows grammatical rules but contains occasional errors. Some sentences may lack clarity due to minor grammatical mistakes. Overall, the text is understandable but could be improved.
**3 - Good**: Text demonstrates solid grasp of grammar with few errors. Sentences are clear and effectively convey the intended message. Minor errors may be present but do not significantly detract from comprehension.
**4 - Very Good**: Text exhibits strong command of grammar with rare errors. Sentences are well-structured and articulate. The text flows smoothly and effectively communicates ideas.
**5 - Excellent**: Text is virtually error-free in terms of grammar. Sentences are precise, concise, and grammatically correct. The writing demonstrates mastery of language conventions and enhances readability.

YOU WILL ONLY RETURN A INTEGER, WHICH IS THE SCORE. NOTHING ELSE";

pub fn grammar_prompt(text: &str) -> ChatPrompt {
    ChatPrompt {
        messages: vec![
            ChatMessage::system(RUBRIC),
            ChatMessage::user(format!("Score the following text: {text}.")),
        ],
        temperature: 0.0,
        max_tokens: 10,
    }
}

/// First ASCII digit in a model reply, e.g. `"Score: 4 out of 5"` gives 4.
pub fn extract_grammar_score(reply: &str) -> Option<u8> {
    reply
        .chars()
        .find_map(|c| c.to_digit(10))
        .map(|d| d as u8)
}

#[derive(Clone)]
pub struct GrammarScorer {
    generator: Arc<dyn TextGenerator>,
}

impl GrammarScorer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Scores `text` from 0 to 5. A reply without a digit is an error; digits
    /// above the rubric are capped at [`MAX_GRAMMAR_SCORE`].
    pub async fn score(&self, text: &str) -> Result<u8, GenerateError> {
        let started = Instant::now();
        let reply = self.generator.generate(grammar_prompt(text)).await?;
        let raw = extract_grammar_score(&reply)
            .ok_or_else(|| GenerateError::InvalidResponse(format!("no grammar score in {reply:?}")))?;
        if raw > MAX_GRAMMAR_SCORE {
            tracing::warn!(raw, reply = %reply, "grammar score above rubric, capping");
        }
        let score = raw.min(MAX_GRAMMAR_SCORE);
        tracing::info!(
            score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "grammar score calculated"
        );
        Ok(score)
    }
}
