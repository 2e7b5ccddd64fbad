//! Text embedding backends.
//!
//! [`HashingEmbedder`] runs fully offline and is deterministic, which makes
//! it the default and the backend used by tests. [`HttpEmbedder`] talks to
//! any OpenAI-compatible `/embeddings` endpoint.

use async_trait::async_trait;

use crate::{error::Result, openai::OpenAiClient, text_util};

/// Default embedding dimension, matching all-MiniLM-L6-v2.
pub const DEFAULT_DIMENSION: usize = 384;

pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

/// Maps text to fixed-length vectors.
///
/// Calls go through [`crate::resilience::CallPolicy`] in the index, so
/// implementations should not retry on their own.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        Ok(vectors.pop().unwrap_or_default())
    }
}

/// Signed feature hashing over lowercase words and word bigrams.
///
/// Texts that share vocabulary land close together under cosine
/// similarity. Vectors are L2-normalized and stable across runs.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let words: Vec<String> = text_util::words(text).collect();

        for word in &words {
            self.add_feature(&mut vector, word.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, bigram.as_bytes(), 0.5);
        }

        normalize(&mut vector);
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = blake3::hash(feature);
        let bytes = hash.as_bytes();
        let mut slot = [0u8; 8];
        slot.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(slot) % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Embeddings from an OpenAI-compatible server.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: OpenAiClient,
    model: String,
}

impl HttpEmbedder {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.client.embeddings(&self.model, texts).await
    }
}

/// Scale `vector` to unit length. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; 0.0 when either vector is zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_one("refund policy for orders");
        let b = embedder.embed_one("refund policy for orders");

        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed_one("what is the refund policy");
        let related = embedder.embed_one("Our refund policy allows returns.");
        let unrelated = embedder.embed_one("Kubernetes pods restart on crash.");

        assert!(
            cosine_similarity(&query, &related)
                > cosine_similarity(&query, &unrelated)
        );
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let v = HashingEmbedder::new(8).embed_one("  ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        let same = cosine_similarity(&[3.0, 4.0], &[3.0, 4.0]);
        assert!((same - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn embed_query_uses_batch_path() {
        let embedder = HashingEmbedder::new(16);
        let single = embedder.embed_query("hello world").await.unwrap();
        let batch = embedder.embed(&["hello world".to_string()]).await.unwrap();
        assert_eq!(single, batch[0]);
    }
}
