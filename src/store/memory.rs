use async_trait::async_trait;
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::BTreeMap;

use super::{
    Capabilities, CollectionInfo, Filter, Metric, ScoredChunk, StoredChunk, VectorStore,
    check_dimensions, cosine_similarity, missing, top_k,
};
use crate::error::{RagError, RagResult};
use crate::types::{ChunkIdentity, CollectionId};

#[derive(Debug)]
struct MemoryCollection {
    dimension: usize,
    chunks: BTreeMap<ChunkIdentity, StoredChunk>,
}

/// In-process store with brute-force cosine scoring.
///
/// Nothing survives the process. Used for tests, the CLI's ephemeral mode,
/// and embedding the pipeline in another service that persists elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<CollectionId, MemoryCollection>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            hybrid: false,
            metadata_filters: true,
            atomic_upsert: true,
            synchronous_delete: true,
            metric: Metric::Cosine,
        }
    }

    async fn ensure_collection(
        &self,
        collection: &CollectionId,
        dimension: usize,
    ) -> RagResult<CollectionInfo> {
        let entry = self
            .collections
            .entry(collection.clone())
            .or_insert_with(|| MemoryCollection {
                dimension,
                chunks: BTreeMap::new(),
            });
        if entry.dimension != dimension {
            return Err(RagError::DimensionalityConflict {
                collection: collection.to_string(),
                expected: entry.dimension,
                actual: dimension,
            });
        }
        Ok(CollectionInfo {
            collection: collection.clone(),
            dimension,
        })
    }

    async fn collection_info(
        &self,
        collection: &CollectionId,
    ) -> RagResult<Option<CollectionInfo>> {
        Ok(self.collections.get(collection).map(|c| CollectionInfo {
            collection: collection.clone(),
            dimension: c.dimension,
        }))
    }

    async fn drop_collection(&self, collection: &CollectionId) -> RagResult<()> {
        self.collections.remove(collection);
        Ok(())
    }

    async fn upsert(&self, collection: &CollectionId, chunks: &[StoredChunk]) -> RagResult<()> {
        let mut entry = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;
        check_dimensions(
            collection,
            entry.dimension,
            chunks.iter().map(|c| c.vector.as_slice()),
        )?;
        for chunk in chunks {
            entry.chunks.insert(chunk.identity.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn delete(&self, collection: &CollectionId, filter: &Filter) -> RagResult<usize> {
        let Some(mut entry) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = entry.chunks.len();
        entry
            .chunks
            .retain(|identity, chunk| !filter.matches(identity, &chunk.metadata));
        Ok(before - entry.chunks.len())
    }

    async fn list_identities(
        &self,
        collection: &CollectionId,
        filter: &Filter,
    ) -> RagResult<Vec<ChunkIdentity>> {
        let Some(entry) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .chunks
            .iter()
            .filter(|(identity, chunk)| filter.matches(identity, &chunk.metadata))
            .map(|(identity, _)| identity.clone())
            .collect())
    }

    async fn count(&self, collection: &CollectionId) -> RagResult<usize> {
        Ok(self
            .collections
            .get(collection)
            .map_or(0, |c| c.chunks.len()))
    }

    async fn query(
        &self,
        collection: &CollectionId,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> RagResult<Vec<ScoredChunk>> {
        let entry = self
            .collections
            .get(collection)
            .ok_or_else(|| missing(collection))?;
        check_dimensions(collection, entry.dimension, [vector])?;

        let chunks: Vec<&StoredChunk> = entry
            .chunks
            .values()
            .filter(|c| filter.is_none_or(|f| f.matches(&c.identity, &c.metadata)))
            .collect();
        let hits = chunks
            .par_iter()
            .map(|c| ScoredChunk::from_stored(c, cosine_similarity(vector, &c.vector)))
            .collect();
        Ok(top_k(hits, k))
    }
}
