use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::Embedder;
use crate::error::{RagError, RagResult};

/// Deterministic bag-of-words embedding via signed feature hashing.
///
/// Texts sharing words get similar vectors. No model, no network, so it is
/// the default for tests and offline setups.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for term in terms(text) {
            let digest = Sha256::digest(term.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]);
            let index = (bucket % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

/// Lowercased alphanumeric words.
pub(crate) fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        1024
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        if texts.len() > self.max_batch_size() {
            return Err(RagError::EmbeddingRejected(format!(
                "batch of {} exceeds {}",
                texts.len(),
                self.max_batch_size()
            )));
        }
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
