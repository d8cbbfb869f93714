//! Text to vector embedding.
//!
//! Backends implement [`Embedder`]. The pipeline always talks to them through
//! [`BatchingEmbedder`], which enforces the batch ceiling, input limits, the
//! declared dimensionality, and retries transient failures.

mod hashing;
mod local;
mod remote;

pub use hashing::HashingEmbedder;
pub(crate) use hashing::terms;
pub use local::{FastEmbedder, default_cache_dir, parse_model};
pub use remote::RemoteEmbedder;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{RagError, RagResult};
use crate::retry::{RetryPolicy, retry};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Short identifier used in logs and collection metadata.
    fn name(&self) -> &str;

    /// Length of every vector this instance returns.
    fn dimension(&self) -> usize;

    /// Largest batch the backend accepts in one call.
    fn max_batch_size(&self) -> usize;

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> RagResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::EmbeddingRejected("backend returned no vector".to_string()))
    }
}

/// Wraps a backend: splits oversized batches, rejects inputs above the
/// length limit, checks the returned shape, and retries transient errors.
pub struct BatchingEmbedder {
    inner: Arc<dyn Embedder>,
    max_batch_size: usize,
    max_input_chars: usize,
    policy: RetryPolicy,
}

impl BatchingEmbedder {
    pub fn new(
        inner: Arc<dyn Embedder>,
        max_batch_size: usize,
        max_input_chars: usize,
        policy: RetryPolicy,
    ) -> Self {
        let max_batch_size = max_batch_size.min(inner.max_batch_size()).max(1);
        Self {
            inner,
            max_batch_size,
            max_input_chars,
            policy,
        }
    }

    fn check_shape(&self, batch: &[String], vectors: &[Vec<f32>]) -> RagResult<()> {
        if vectors.len() != batch.len() {
            return Err(RagError::EmbeddingRejected(format!(
                "{} returned {} vectors for {} inputs",
                self.inner.name(),
                vectors.len(),
                batch.len()
            )));
        }
        let dimension = self.inner.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(RagError::EmbeddingRejected(format!(
                "{} returned a {}-dimensional vector, declared {dimension}",
                self.inner.name(),
                bad.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for BatchingEmbedder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        if let Some((index, text)) = texts
            .iter()
            .enumerate()
            .find(|(_, t)| t.chars().count() > self.max_input_chars)
        {
            return Err(RagError::EmbeddingRejected(format!(
                "input {index} has {} characters, limit is {}; re-chunk smaller",
                text.chars().count(),
                self.max_input_chars
            )));
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch_size) {
            let embedded = retry(&self.policy, "embed", || self.inner.embed_batch(batch)).await?;
            self.check_shape(batch, &embedded)?;
            vectors.extend(embedded);
        }

        tracing::debug!(
            target: "embed",
            "embedded {} texts in {} batches with {}",
            texts.len(),
            texts.len().div_ceil(self.max_batch_size),
            self.inner.name()
        );
        Ok(vectors)
    }
}

/// Build the configured backend wrapped in a [`BatchingEmbedder`].
pub async fn build_embedder(
    config: &EmbeddingConfig,
    policy: RetryPolicy,
) -> RagResult<Arc<dyn Embedder>> {
    let backend: Arc<dyn Embedder> = match config.backend {
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(config.dimension)),
        EmbeddingBackend::Remote => Arc::new(RemoteEmbedder::new(config, policy.call_timeout)?),
        EmbeddingBackend::Fastembed => {
            let config = config.clone();
            let embedder = tokio::task::spawn_blocking(move || FastEmbedder::new(&config))
                .await
                .map_err(|e| RagError::EmbeddingUnavailable(format!("model init task: {e}")))??;
            Arc::new(embedder)
        }
    };

    tracing::info!(
        target: "embed",
        "embedding backend {} ready ({} dimensions)",
        backend.name(),
        backend.dimension()
    );

    Ok(Arc::new(BatchingEmbedder::new(
        backend,
        config.max_batch_size,
        config.max_input_chars,
        policy,
    )))
}
