//! Shared builders for the end-to-end tests.

use std::path::Path;
use std::sync::Arc;

use groundwork::config::{ChunkingConfig, StoreBackend};
use groundwork::store::{MemoryStore, SqliteStore, TantivyStore};
use groundwork::{HashingEmbedder, MemoryStorageProvider, Pipeline, Settings, VectorStore};

pub const DIM: usize = 256;

/// Backends that run without external services.
pub const LOCAL_BACKENDS: [StoreBackend; 3] =
    [StoreBackend::Memory, StoreBackend::Sqlite, StoreBackend::Tantivy];

pub fn settings(data_dir: &Path, backend: StoreBackend) -> Settings {
    let mut settings = Settings::default();
    settings.data_dir = data_dir.to_path_buf();
    settings.store.backend = backend;
    settings.store.delete_poll_interval_ms = 5;
    settings.embedding.dimension = DIM;
    settings.chunking = ChunkingConfig::new(40, 8);
    settings.ingestion.workers = 4;
    settings.retry.base_delay_ms = 1;
    settings.retry.max_delay_ms = 2;
    settings.retrieval.relevance_cutoff = 0.0;
    settings
}

pub async fn open_store(backend: StoreBackend, data_dir: &Path) -> Arc<dyn VectorStore> {
    match backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(
            SqliteStore::open(&data_dir.join("vectors.db"), 2)
                .await
                .unwrap(),
        ),
        StoreBackend::Tantivy => {
            Arc::new(TantivyStore::open(data_dir.join("tantivy"), 0.3).unwrap())
        }
        StoreBackend::Qdrant => panic!("qdrant needs a running server"),
    }
}

pub fn pipeline(settings: Settings, store: Arc<dyn VectorStore>) -> Pipeline {
    pipeline_with_provider(settings, store, Arc::new(MemoryStorageProvider::new()))
}

pub fn pipeline_with_provider(
    settings: Settings,
    store: Arc<dyn VectorStore>,
    provider: Arc<MemoryStorageProvider>,
) -> Pipeline {
    let dimension = settings.embedding.dimension;
    Pipeline::from_parts(
        Arc::new(settings),
        store,
        Arc::new(HashingEmbedder::new(dimension)),
        None,
        provider,
    )
    .unwrap()
}

/// `count` distinct words separated by single spaces.
pub fn words(prefix: &str, count: usize) -> String {
    (0..count)
        .map(|i| format!("{prefix}{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}
