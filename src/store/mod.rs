//! Vector store abstraction and backends.
//!
//! Every backend implements [`VectorStore`] and declares what it can do
//! through [`Capabilities`]. Callers branch on capabilities, never on the
//! concrete backend.
//!
//! Shared contract:
//! - `upsert` is idempotent by [`ChunkIdentity`]
//! - `query` returns exactly `min(k, matches after filter)` results ordered by
//!   decreasing similarity, ties broken by identity
//! - a vector whose length differs from the collection's dimension fails with
//!   `DimensionalityConflict` before anything is written

mod cache;
mod fulltext;
mod memory;
mod qdrant;
mod sqlite;

pub use cache::MetadataCache;
pub use fulltext::TantivyStore;
pub use memory::MemoryStore;
pub use qdrant::QdrantStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{RagError, RagResult};
use crate::types::{Chunk, ChunkIdentity, CollectionId, DocumentId, MetaValue, Metadata, TextSpan};

/// Similarity function a backend scores with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    InnerProduct,
}

/// What a backend supports natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// `hybrid_query` is implemented
    pub hybrid: bool,
    /// `query` accepts metadata equality filters
    pub metadata_filters: bool,
    /// A multi-chunk upsert is all-or-nothing
    pub atomic_upsert: bool,
    /// Deleted chunks are invisible as soon as `delete` returns
    pub synchronous_delete: bool,
    pub metric: Metric,
}

/// Dimension and size of one backend collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub collection: CollectionId,
    pub dimension: usize,
}

/// Chunk selection for deletes and queries. All conditions must hold;
/// an empty filter selects everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub document_ids: Vec<DocumentId>,
    #[serde(default)]
    pub equals: Metadata,
}

impl Filter {
    pub fn document(document_id: DocumentId) -> Self {
        Self {
            document_ids: vec![document_id],
            equals: Metadata::new(),
        }
    }

    pub fn with_equals(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.document_ids.is_empty() && self.equals.is_empty()
    }

    pub fn has_metadata(&self) -> bool {
        !self.equals.is_empty()
    }

    /// Copy without the metadata conditions.
    pub fn documents_only(&self) -> Self {
        Self {
            document_ids: self.document_ids.clone(),
            equals: Metadata::new(),
        }
    }

    pub fn matches(&self, identity: &ChunkIdentity, metadata: &Metadata) -> bool {
        if !self.document_ids.is_empty() && !self.document_ids.contains(&identity.document_id) {
            return false;
        }
        self.equals
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// A chunk ready to be written: the embedding is mandatory here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub identity: ChunkIdentity,
    pub span: TextSpan,
    pub text: String,
    pub metadata: Metadata,
    pub vector: Vec<f32>,
}

impl TryFrom<Chunk> for StoredChunk {
    type Error = RagError;

    fn try_from(chunk: Chunk) -> RagResult<Self> {
        let Some(vector) = chunk.embedding else {
            return Err(RagError::EmbeddingRejected(format!(
                "chunk {} has no embedding",
                chunk.identity.key()
            )));
        };
        Ok(Self {
            identity: chunk.identity,
            span: chunk.span,
            text: chunk.text,
            metadata: chunk.metadata,
            vector,
        })
    }
}

/// One query hit as returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub identity: ChunkIdentity,
    pub span: TextSpan,
    pub text: String,
    pub metadata: Metadata,
    pub score: f32,
}

impl ScoredChunk {
    pub fn from_stored(chunk: &StoredChunk, score: f32) -> Self {
        Self {
            identity: chunk.identity.clone(),
            span: chunk.span,
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
            score,
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name for logs and errors.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Create the collection, or confirm it exists with the same dimension.
    async fn ensure_collection(
        &self,
        collection: &CollectionId,
        dimension: usize,
    ) -> RagResult<CollectionInfo>;

    async fn collection_info(&self, collection: &CollectionId)
    -> RagResult<Option<CollectionInfo>>;

    /// Remove the collection and every chunk in it. Missing is not an error.
    async fn drop_collection(&self, collection: &CollectionId) -> RagResult<()>;

    async fn upsert(&self, collection: &CollectionId, chunks: &[StoredChunk]) -> RagResult<()>;

    /// Delete matching chunks and return how many were removed.
    async fn delete(&self, collection: &CollectionId, filter: &Filter) -> RagResult<usize>;

    async fn list_identities(
        &self,
        collection: &CollectionId,
        filter: &Filter,
    ) -> RagResult<Vec<ChunkIdentity>>;

    async fn count(&self, collection: &CollectionId) -> RagResult<usize>;

    async fn query(
        &self,
        collection: &CollectionId,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> RagResult<Vec<ScoredChunk>>;

    async fn hybrid_query(
        &self,
        _collection: &CollectionId,
        _vector: &[f32],
        _text: &str,
        _k: usize,
        _filter: Option<&Filter>,
    ) -> RagResult<Vec<ScoredChunk>> {
        Err(RagError::CapabilityUnsupported {
            backend: self.name(),
            capability: "hybrid_query",
        })
    }

    async fn document_exists(
        &self,
        collection: &CollectionId,
        document_id: &DocumentId,
    ) -> RagResult<bool> {
        let ids = self
            .list_identities(collection, &Filter::document(document_id.clone()))
            .await?;
        Ok(!ids.is_empty())
    }
}

/// Open the configured backend. Relative paths resolve against `data_dir`.
pub async fn open_store(
    config: &StoreConfig,
    data_dir: &Path,
    lexical_weight: f32,
) -> RagResult<Arc<dyn VectorStore>> {
    let store: Arc<dyn VectorStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Tantivy => {
            Arc::new(TantivyStore::open(data_dir.join("tantivy"), lexical_weight)?)
        }
        StoreBackend::Sqlite => {
            let path = if config.sqlite_path.is_absolute() {
                config.sqlite_path.clone()
            } else {
                data_dir.join(&config.sqlite_path)
            };
            Arc::new(SqliteStore::open(&path, config.sqlite_max_connections).await?)
        }
        StoreBackend::Qdrant => Arc::new(QdrantStore::new(
            &config.qdrant_url,
            std::env::var(&config.qdrant_api_key_env).ok(),
        )?),
    };
    tracing::info!(target: "store", "opened {} vector store", store.name());
    Ok(store)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Fail with `DimensionalityConflict` if any vector has the wrong length.
pub(crate) fn check_dimensions<'a>(
    collection: &CollectionId,
    expected: usize,
    vectors: impl IntoIterator<Item = &'a [f32]>,
) -> RagResult<()> {
    match vectors.into_iter().find(|v| v.len() != expected) {
        Some(bad) => Err(RagError::DimensionalityConflict {
            collection: collection.to_string(),
            expected,
            actual: bad.len(),
        }),
        None => Ok(()),
    }
}

/// Descending score, then identity ascending, so equal scores order stably.
pub(crate) fn rank_order(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.identity.cmp(&b.identity))
}

pub(crate) fn top_k(mut hits: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    hits.sort_by(rank_order);
    hits.truncate(k);
    hits
}

pub(crate) fn missing(collection: &CollectionId) -> RagError {
    RagError::NotFound(format!("collection '{collection}'"))
}

/// Encode vectors as little-endian f32 bytes.
pub(crate) fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn vector_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the backend tests.

    use super::*;

    pub fn chunk(document: &str, seq: u32, vector: Vec<f32>) -> StoredChunk {
        let mut metadata = Metadata::new();
        metadata.insert("document_id".into(), document.into());
        StoredChunk {
            identity: ChunkIdentity::new(DocumentId::new(document), seq),
            span: TextSpan::new(seq as usize * 10, seq as usize * 10 + 10),
            text: format!("{document} chunk {seq}"),
            metadata,
            vector,
        }
    }

    /// Runs the shared contract against any backend.
    pub async fn exercise_contract(store: &dyn VectorStore) {
        let collection = CollectionId::new("contract");
        let info = store.ensure_collection(&collection, 3).await.unwrap();
        assert_eq!(info.dimension, 3);
        store.ensure_collection(&collection, 3).await.unwrap();
        assert!(matches!(
            store.ensure_collection(&collection, 4).await,
            Err(RagError::DimensionalityConflict { expected: 3, actual: 4, .. })
        ));

        let chunks = vec![
            chunk("a", 0, vec![1.0, 0.0, 0.0]),
            chunk("a", 1, vec![0.9, 0.1, 0.0]),
            chunk("b", 0, vec![0.0, 1.0, 0.0]),
        ];
        store.upsert(&collection, &chunks).await.unwrap();
        // Same identities again replace, not duplicate
        store.upsert(&collection, &chunks).await.unwrap();
        assert_eq!(store.count(&collection).await.unwrap(), 3);

        let hits = store
            .query(&collection, &[1.0, 0.0, 0.0], 2, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].identity, ChunkIdentity::new("a".into(), 0));
        assert!(hits[0].score >= hits[1].score);

        let all = store
            .query(&collection, &[1.0, 0.0, 0.0], 10, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 3, "k above the collection size returns everything");

        let only_b = store
            .query(
                &collection,
                &[1.0, 0.0, 0.0],
                10,
                Some(&Filter::document("b".into())),
            )
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].identity.document_id.as_str(), "b");

        let wrong = vec![chunk("c", 0, vec![1.0, 0.0])];
        assert!(matches!(
            store.upsert(&collection, &wrong).await,
            Err(RagError::DimensionalityConflict { .. })
        ));
        assert_eq!(store.count(&collection).await.unwrap(), 3);

        let removed = store
            .delete(&collection, &Filter::document("a".into()))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        if !store.capabilities().synchronous_delete {
            for _ in 0..20 {
                if !store.document_exists(&collection, &"a".into()).await.unwrap() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
        assert!(!store.document_exists(&collection, &"a".into()).await.unwrap());
        assert!(store.document_exists(&collection, &"b".into()).await.unwrap());
        let after = store
            .query(&collection, &[1.0, 0.0, 0.0], 10, None)
            .await
            .unwrap();
        assert!(after.iter().all(|h| h.identity.document_id.as_str() != "a"));

        store.drop_collection(&collection).await.unwrap();
        assert!(store.collection_info(&collection).await.unwrap().is_none());
        store.drop_collection(&collection).await.unwrap();
    }
}
