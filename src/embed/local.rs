//! Local ONNX embeddings through fastembed.
//!
//! Model instances are expensive (~86MB each for AllMiniLML6V2), so a small
//! pool is created once and instances are checked out per batch. Inference
//! is CPU-bound and runs on tokio's blocking pool.

use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender, bounded};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::{RagError, RagResult};

/// Map a configured model name to a fastembed model.
pub fn parse_model(name: &str) -> RagResult<EmbeddingModel> {
    let model = match name {
        "AllMiniLML6V2" => EmbeddingModel::AllMiniLML6V2,
        "AllMiniLML12V2" => EmbeddingModel::AllMiniLML12V2,
        "BGESmallENV15" => EmbeddingModel::BGESmallENV15,
        "BGEBaseENV15" => EmbeddingModel::BGEBaseENV15,
        "BGELargeENV15" => EmbeddingModel::BGELargeENV15,
        "MultilingualE5Small" => EmbeddingModel::MultilingualE5Small,
        "MultilingualE5Base" => EmbeddingModel::MultilingualE5Base,
        "NomicEmbedTextV15" => EmbeddingModel::NomicEmbedTextV15,
        other => {
            return Err(RagError::InvalidConfig(format!(
                "unknown embedding model '{other}'"
            )));
        }
    };
    Ok(model)
}

/// Where downloaded models are cached when no directory is configured.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("groundwork").join("models"))
        .unwrap_or_else(|| PathBuf::from(".groundwork/models"))
}

struct ModelInstance {
    model: TextEmbedding,
    id: usize,
}

struct Pool {
    sender: Sender<ModelInstance>,
    receiver: Receiver<ModelInstance>,
    usage: Vec<AtomicUsize>,
}

impl Pool {
    fn acquire(&self) -> RagResult<ModelInstance> {
        let instance = self
            .receiver
            .recv()
            .map_err(|_| RagError::EmbeddingUnavailable("model pool closed".to_string()))?;
        self.usage[instance.id].fetch_add(1, Ordering::Relaxed);
        Ok(instance)
    }

    fn release(&self, instance: ModelInstance) {
        let _ = self.sender.send(instance);
    }

    fn embed(&self, texts: Vec<String>) -> RagResult<Vec<Vec<f32>>> {
        let mut instance = self.acquire()?;
        let result = instance.model.embed(texts, None);
        self.release(instance);
        result.map_err(|e| RagError::EmbeddingRejected(format!("fastembed: {e}")))
    }
}

pub struct FastEmbedder {
    pool: Arc<Pool>,
    model_name: String,
    dimension: usize,
    max_batch_size: usize,
}

impl FastEmbedder {
    /// Load `pool_size` instances of the configured model. Blocking; may
    /// download the model on first use.
    pub fn new(config: &EmbeddingConfig) -> RagResult<Self> {
        let model = parse_model(&config.model)?;
        let pool_size = config.pool_size.max(1);
        let cache_dir = config.cache_dir.clone().unwrap_or_else(default_cache_dir);
        let (sender, receiver) = bounded(pool_size);

        tracing::info!(
            target: "embed",
            "initializing embedding pool: {pool_size} instances ({})",
            config.model
        );

        let mut dimension = 0;
        for i in 0..pool_size {
            let mut text_model = TextEmbedding::try_new(
                InitOptions::new(model.clone())
                    .with_cache_dir(cache_dir.clone())
                    .with_show_download_progress(i == 0),
            )
            .map_err(|e| {
                RagError::EmbeddingUnavailable(format!(
                    "failed to initialize model instance {}: {e}",
                    i + 1
                ))
            })?;

            if i == 0 {
                let probe = text_model
                    .embed(vec!["test"], None)
                    .map_err(|e| RagError::EmbeddingUnavailable(e.to_string()))?;
                dimension = probe.first().map(Vec::len).unwrap_or_default();
            }

            sender
                .send(ModelInstance {
                    model: text_model,
                    id: i,
                })
                .map_err(|_| RagError::EmbeddingUnavailable("model pool closed".to_string()))?;
        }

        if dimension != config.dimension {
            tracing::warn!(
                target: "embed",
                "model {} produces {dimension} dimensions, config says {}; using {dimension}",
                config.model,
                config.dimension
            );
        }

        Ok(Self {
            pool: Arc::new(Pool {
                sender,
                receiver,
                usage: (0..pool_size).map(|_| AtomicUsize::new(0)).collect(),
            }),
            model_name: config.model.clone(),
            dimension,
            max_batch_size: config.max_batch_size.max(1),
        })
    }

    /// Batches served by each pooled instance.
    pub fn usage(&self) -> Vec<usize> {
        self.pool
            .usage
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let pool = self.pool.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || pool.embed(texts))
            .await
            .map_err(|e| RagError::EmbeddingUnavailable(format!("embedding task: {e}")))?
    }
}
