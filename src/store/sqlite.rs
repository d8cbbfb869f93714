//! SQLite-backed vector store.
//!
//! Chunks live in one table keyed by (collection, document, seq) with the
//! embedding as a little-endian f32 BLOB. Search is brute-force cosine over
//! the collection. Only document-id filters are pushed into SQL; metadata
//! deletes are emulated by listing then deleting.

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;

use super::{
    Capabilities, CollectionInfo, Filter, Metric, ScoredChunk, StoredChunk, VectorStore,
    check_dimensions, cosine_similarity, missing, top_k, vector_from_bytes, vector_to_bytes,
};
use crate::error::{RagError, RagResult};
use crate::types::{ChunkIdentity, CollectionId, DocumentId, Metadata, TextSpan};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path, max_connections: u32) -> RagResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::debug!(target: "store", "sqlite store at {}", path.display());
        Ok(store)
    }

    async fn init_schema(&self) -> RagResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                dimension INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                collection TEXT NOT NULL,
                document_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                span_start INTEGER NOT NULL,
                span_end INTEGER NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                PRIMARY KEY (collection, document_id, seq)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn dimension(&self, collection: &CollectionId) -> RagResult<Option<usize>> {
        let dimension: Option<i64> =
            sqlx::query_scalar("SELECT dimension FROM collections WHERE name = ?1")
                .bind(collection.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(dimension.map(|d| d as usize))
    }

    fn unsupported_metadata(&self) -> RagError {
        RagError::CapabilityUnsupported {
            backend: self.name(),
            capability: "metadata_filters",
        }
    }

    /// `SELECT <columns> FROM chunks WHERE collection = ? [AND document_id IN (...)]`
    fn select<'a>(
        columns: &str,
        collection: &'a CollectionId,
        filter: Option<&'a Filter>,
    ) -> QueryBuilder<'a, Sqlite> {
        let mut builder = QueryBuilder::new(format!("SELECT {columns} FROM chunks WHERE collection = "));
        builder.push_bind(collection.as_str());
        if let Some(filter) = filter.filter(|f| !f.document_ids.is_empty()) {
            builder.push(" AND document_id IN (");
            let mut ids = builder.separated(", ");
            for id in &filter.document_ids {
                ids.push_bind(id.as_str());
            }
            ids.push_unseparated(")");
        }
        builder
    }

    fn row_identity(row: &SqliteRow) -> RagResult<ChunkIdentity> {
        let document_id: String = row.try_get("document_id")?;
        let seq: i64 = row.try_get("seq")?;
        Ok(ChunkIdentity::new(DocumentId::new(document_id), seq as u32))
    }

    fn row_metadata(row: &SqliteRow) -> RagResult<Metadata> {
        let metadata: String = row.try_get("metadata")?;
        Ok(serde_json::from_str(&metadata)?)
    }

    fn row_to_scored(row: &SqliteRow, vector: &[f32]) -> RagResult<ScoredChunk> {
        let embedding: Vec<u8> = row.try_get("embedding")?;
        let start: i64 = row.try_get("span_start")?;
        let end: i64 = row.try_get("span_end")?;
        Ok(ScoredChunk {
            identity: Self::row_identity(row)?,
            span: TextSpan::new(start as usize, end as usize),
            text: row.try_get("content")?,
            metadata: Self::row_metadata(row)?,
            score: cosine_similarity(vector, &vector_from_bytes(&embedding)),
        })
    }

    async fn delete_identities(
        &self,
        collection: &CollectionId,
        identities: &[ChunkIdentity],
    ) -> RagResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for identity in identities {
            let result = sqlx::query(
                "DELETE FROM chunks WHERE collection = ?1 AND document_id = ?2 AND seq = ?3",
            )
            .bind(collection.as_str())
            .bind(identity.document_id.as_str())
            .bind(i64::from(identity.seq))
            .execute(&mut *tx)
            .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            hybrid: false,
            metadata_filters: false,
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
        sqlx::query("INSERT OR IGNORE INTO collections (name, dimension) VALUES (?1, ?2)")
            .bind(collection.as_str())
            .bind(dimension as i64)
            .execute(&self.pool)
            .await?;

        let existing = self
            .dimension(collection)
            .await?
            .ok_or_else(|| missing(collection))?;
        if existing != dimension {
            return Err(RagError::DimensionalityConflict {
                collection: collection.to_string(),
                expected: existing,
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
        Ok(self
            .dimension(collection)
            .await?
            .map(|dimension| CollectionInfo {
                collection: collection.clone(),
                dimension,
            }))
    }

    async fn drop_collection(&self, collection: &CollectionId) -> RagResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE collection = ?1")
            .bind(collection.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?1")
            .bind(collection.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert(&self, collection: &CollectionId, chunks: &[StoredChunk]) -> RagResult<()> {
        let dimension = self
            .dimension(collection)
            .await?
            .ok_or_else(|| missing(collection))?;
        check_dimensions(
            collection,
            dimension,
            chunks.iter().map(|c| c.vector.as_slice()),
        )?;
        if chunks.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            let metadata = serde_json::to_string(&chunk.metadata)?;
            sqlx::query(
                "INSERT OR REPLACE INTO chunks
                 (collection, document_id, seq, span_start, span_end, content, metadata, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(collection.as_str())
            .bind(chunk.identity.document_id.as_str())
            .bind(i64::from(chunk.identity.seq))
            .bind(chunk.span.start as i64)
            .bind(chunk.span.end as i64)
            .bind(&chunk.text)
            .bind(&metadata)
            .bind(vector_to_bytes(&chunk.vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, collection: &CollectionId, filter: &Filter) -> RagResult<usize> {
        if filter.has_metadata() {
            // Emulated: list matching identities, then delete them by key
            let identities = self.list_identities(collection, filter).await?;
            return self.delete_identities(collection, &identities).await;
        }

        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM chunks WHERE collection = ");
        builder.push_bind(collection.as_str());
        if !filter.document_ids.is_empty() {
            builder.push(" AND document_id IN (");
            let mut ids = builder.separated(", ");
            for id in &filter.document_ids {
                ids.push_bind(id.as_str());
            }
            ids.push_unseparated(")");
        }
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_identities(
        &self,
        collection: &CollectionId,
        filter: &Filter,
    ) -> RagResult<Vec<ChunkIdentity>> {
        let mut builder = Self::select("document_id, seq, metadata", collection, Some(filter));
        builder.push(" ORDER BY document_id, seq");
        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut identities = Vec::with_capacity(rows.len());
        for row in &rows {
            let identity = Self::row_identity(row)?;
            if filter.has_metadata() && !filter.matches(&identity, &Self::row_metadata(row)?) {
                continue;
            }
            identities.push(identity);
        }
        Ok(identities)
    }

    async fn count(&self, collection: &CollectionId) -> RagResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE collection = ?1")
            .bind(collection.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn query(
        &self,
        collection: &CollectionId,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> RagResult<Vec<ScoredChunk>> {
        if filter.is_some_and(Filter::has_metadata) {
            return Err(self.unsupported_metadata());
        }
        let dimension = self
            .dimension(collection)
            .await?
            .ok_or_else(|| missing(collection))?;
        check_dimensions(collection, dimension, [vector])?;

        let rows = Self::select(
            "document_id, seq, span_start, span_end, content, metadata, embedding",
            collection,
            filter,
        )
        .build()
        .fetch_all(&self.pool)
        .await?;

        let hits = rows
            .iter()
            .map(|row| Self::row_to_scored(row, vector))
            .collect::<RagResult<Vec<_>>>()?;
        Ok(top_k(hits, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{chunk, exercise_contract};
    use tempfile::TempDir;

    async fn open(temp: &TempDir) -> SqliteStore {
        SqliteStore::open(&temp.path().join("vectors.db"), 2)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_store_contract() {
        let temp = TempDir::new().unwrap();
        exercise_contract(&open(&temp).await).await;
    }

    #[tokio::test]
    async fn test_metadata_query_is_unsupported() {
        let temp = TempDir::new().unwrap();
        let store = open(&temp).await;
        let collection = CollectionId::new("docs");
        store.ensure_collection(&collection, 2).await.unwrap();

        let filter = Filter::default().with_equals("lang", "en");
        let err = store
            .query(&collection, &[1.0, 0.0], 3, Some(&filter))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::CapabilityUnsupported { .. }));
    }

    #[tokio::test]
    async fn test_metadata_delete_is_emulated() {
        let temp = TempDir::new().unwrap();
        let store = open(&temp).await;
        let collection = CollectionId::new("docs");
        store.ensure_collection(&collection, 2).await.unwrap();

        let mut english = chunk("a", 0, vec![1.0, 0.0]);
        english.metadata.insert("lang".into(), "en".into());
        let other = chunk("a", 1, vec![0.0, 1.0]);
        store.upsert(&collection, &[english, other]).await.unwrap();

        let removed = store
            .delete(&collection, &Filter::default().with_equals("lang", "en"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store
                .list_identities(&collection, &Filter::default())
                .await
                .unwrap(),
            vec![ChunkIdentity::new("a".into(), 1)]
        );
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let collection = CollectionId::new("docs");
        {
            let store = open(&temp).await;
            store.ensure_collection(&collection, 2).await.unwrap();
            store
                .upsert(&collection, &[chunk("a", 0, vec![1.0, 0.0])])
                .await
                .unwrap();
        }
        let store = open(&temp).await;
        assert_eq!(store.count(&collection).await.unwrap(), 1);
        let hits = store
            .query(&collection, &[1.0, 0.0], 1, None)
            .await
            .unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }
}
