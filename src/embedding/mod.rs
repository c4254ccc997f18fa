//! Embedding provider trait and vector utilities.
//!
//! The research pipeline only needs batch embedding plus (optionally)
//! reranking; everything else about the embedding backend is a deployment
//! concern hidden behind [`EmbeddingProvider`].

mod hash;

use async_trait::async_trait;

use crate::error::EmbeddingError;

pub use hash::HashEmbedder;

/// Default embedding dimensionality for the hash fallback.
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Maximum tokens per document sent to a reranker; longer documents are
/// truncated before batching.
pub const RERANK_DOCUMENT_TOKEN_CAP: usize = 2000;

/// A single rerank result: the document index and its relevance score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankResult {
    /// Index into the submitted document list.
    pub index: usize,
    /// Relevance score for the query (higher is more relevant).
    pub score: f32,
}

/// Trait for embedding provider backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name (e.g. `"hash"`, `"voyage"`).
    fn name(&self) -> &'static str;

    /// Embedding dimensionality.
    fn dimensions(&self) -> usize;

    /// Embeds a batch of texts.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError`] on backend failures.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Whether [`EmbeddingProvider::rerank`] is implemented.
    fn supports_reranking(&self) -> bool {
        false
    }

    /// Reranks documents against a query, returning `(index, score)` pairs
    /// in descending score order.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::RerankUnsupported`] by default.
    async fn rerank(
        &self,
        _query: &str,
        _documents: &[String],
    ) -> Result<Vec<RerankResult>, EmbeddingError> {
        Err(EmbeddingError::RerankUnsupported {
            provider: self.name().to_string(),
        })
    }

    /// Maximum documents per rerank call.
    fn max_rerank_batch_size(&self) -> usize {
        32
    }
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths or zero-magnitude inputs.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Euclidean distance between two vectors.
#[must_use]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Cosine distance (`1 - cosine_similarity`), the metric used for gap-query
/// clustering.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_mismatched_lengths() {
        assert!(cosine_similarity(&[1.0], &[1.0, 2.0]).abs() < f32::EPSILON);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < f32::EPSILON);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        assert!((euclidean_distance(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_complements_similarity() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![3.0, 2.0, 1.0];
        let sim = cosine_similarity(&a, &b);
        assert!((cosine_distance(&a, &b) - (1.0 - sim)).abs() < 1e-6);
    }
}
