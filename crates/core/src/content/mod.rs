//! Topic reference text and transcript similarity.

mod reference;
mod similarity;

pub use reference::{reference_prompt, ReferenceGenerator};
pub use similarity::{
    cosine_similarity, Embedder, EmbeddingSimilarity, OpenAiEmbedder, SimilarityError,
    SimilarityScorer,
};
