//! Embedding module - the seam between the index and the embedding service.
//!
//! The storage engine and retriever only ever see the [`Embedder`] trait;
//! the production implementation is the HTTP [`provider::EmbeddingProvider`].
//! Tests substitute a deterministic in-process embedder.

pub mod provider;

use crate::error::Result;

/// A source of fixed-dimension embedding vectors.
pub trait Embedder: Send + Sync {
    /// Model identifier, recorded in the settings registry at bootstrap.
    fn model(&self) -> &str;

    /// Embed a batch of texts. Returns one vector per input, in input
    /// order. Every input must be nonempty.
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// The model's vector dimension, obtained by embedding a
    /// one-character probe string.
    fn dimension(&self) -> Result<usize> {
        let vectors = self.embed(&["x"])?;
        vectors
            .first()
            .map(Vec::len)
            .ok_or_else(|| crate::error::UridxError::Transient(
                "embedding service returned no vector for the dimension probe".to_string(),
            ))
    }
}
