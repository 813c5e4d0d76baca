/// Mock embedder for testing purposes.
///
/// Generates deterministic bag-of-words embeddings: every token is hashed
/// into a bucket, so texts sharing vocabulary end up close in cosine space.
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Embedder, EmbedderError};
use crate::text::tokenize;

/// A mock embedder that produces deterministic vectors from hashed tokens.
///
/// Useful for testing without calling a real embedding service. Also counts
/// how many embedding calls it has served.
pub struct MockEmbedder {
    pub dimensions: usize,
    calls: AtomicUsize,
}

impl MockEmbedder {
    /// Create a new `MockEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `embed` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() % self.dimensions as u64) as usize
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut embedding = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            embedding[self.bucket(&token)] += 1.0;
        }

        // L2 normalize
        let norm_sq: f32 = embedding.iter().map(|v| v * v).sum();
        if norm_sq > 0.0 {
            let inv = 1.0 / norm_sq.sqrt();
            for v in &mut embedding {
                *v *= inv;
            }
        } else {
            // Keep the vector non-zero so cosine distance stays defined.
            embedding[0] = 1.0;
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_mock_embed_dimensions() {
        let embedder = MockEmbedder::new(384);
        let result = embedder.embed("hello world").await.unwrap();
        assert_eq!(result.len(), 384);
    }

    #[tokio::test]
    async fn test_mock_embed_deterministic() {
        let embedder = MockEmbedder::new(384);
        let a = embedder.embed("hello").await.unwrap();
        let b = embedder.embed("hello").await.unwrap();
        assert_eq!(a, b, "same input should produce same output");
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_embed_normalized() {
        let embedder = MockEmbedder::new(384);
        let vec = embedder.embed("test normalization").await.unwrap();
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!(
            (norm - 1.0).abs() < 0.01,
            "vector should be approximately unit length, got {norm}"
        );
    }

    #[tokio::test]
    async fn test_mock_embed_shared_vocabulary_is_closer() {
        let embedder = MockEmbedder::default();
        let query = embedder.embed("What is the capital of France?").await.unwrap();
        let france = embedder
            .embed("The capital of France is Paris.")
            .await
            .unwrap();
        let germany = embedder
            .embed("The capital of Germany is Berlin.")
            .await
            .unwrap();
        assert!(cosine(&query, &france) > cosine(&query, &germany));
    }

    #[tokio::test]
    async fn test_mock_embed_empty_text_is_not_zero() {
        let embedder = MockEmbedder::new(16);
        let vec = embedder.embed("  ").await.unwrap();
        assert!(vec.iter().any(|v| *v != 0.0));
    }

    #[tokio::test]
    async fn test_mock_embed_batch() {
        let embedder = MockEmbedder::new(128);
        let results = embedder.embed_batch(&["a", "b", "c"]).await.unwrap();
        assert_eq!(results.len(), 3);
        for vec in &results {
            assert_eq!(vec.len(), 128);
        }
    }
}
