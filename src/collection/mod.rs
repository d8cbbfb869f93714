//! Collection management: ingestion orchestration and deletion.
//!
//! Each document runs through its stages independently:
//! 1. Fetch raw bytes (inline text, storage key, or URL); storage keys are
//!    streamed so an oversized object stops at the loader ceiling
//! 2. Load into normalized text plus a structural map
//! 3. Confirm the collection dimension, then drop any previous chunks
//! 4. Chunk lazily, embedding and upserting one batch at a time
//! 5. Mark `ready` only after every upsert returned
//!
//! A failure at any stage marks that document `failed` and removes whatever
//! it wrote. Sibling documents in the same batch are unaffected.

mod locks;
mod registry;

pub use locks::{DocumentGuard, DocumentLocks};
pub use registry::DocumentRegistry;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::chunker::{ChunkSpan, Chunker};
use crate::config::{ConflictPolicy, Settings};
use crate::embed::Embedder;
use crate::error::{RagError, RagResult};
use crate::loader::{LoadedDocument, LoaderRegistry};
use crate::retry::{RetryPolicy, retry};
use crate::storage_provider::{ObjectReader, StorageProvider, UrlFetcher};
use crate::store::{CollectionInfo, Filter, MetadataCache, StoredChunk, VectorStore};
use crate::types::{
    ChunkIdentity, CollectionId, DocumentId, DocumentRecord, DocumentRequest, DocumentStatus,
    FailureDetail, MetaValue, Metadata, SourceRef, meta_keys,
};

/// Source content as handed to the loader.
enum Fetched {
    Bytes(Vec<u8>),
    Reader(ObjectReader),
}

/// What a successful pass produced.
#[derive(Debug)]
struct IngestOutcome {
    text_len: usize,
    chunk_count: usize,
    content_hash: String,
    title: Option<String>,
}

pub struct CollectionManager {
    settings: Arc<Settings>,
    registry: Arc<DocumentRegistry>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    loaders: Arc<LoaderRegistry>,
    chunker: Arc<Chunker>,
    provider: Arc<dyn StorageProvider>,
    fetcher: UrlFetcher,
    cache: MetadataCache,
    locks: DocumentLocks,
    workers: Arc<Semaphore>,
    policy: RetryPolicy,
    collection_tokens: DashMap<CollectionId, CancellationToken>,
    in_flight: DashMap<DocumentId, CancellationToken>,
}

impl std::fmt::Debug for CollectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionManager")
            .field("store", &self.store.name())
            .field("embedder", &self.embedder.name())
            .field("workers", &self.settings.ingestion.workers)
            .finish_non_exhaustive()
    }
}

impl CollectionManager {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<DocumentRegistry>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        loaders: Arc<LoaderRegistry>,
        provider: Arc<dyn StorageProvider>,
    ) -> RagResult<Self> {
        let chunker = Chunker::new(settings.chunking.clone())?;
        let policy = RetryPolicy::from_config(&settings.retry);
        let fetcher = UrlFetcher::new(policy.call_timeout)?;
        Ok(Self {
            cache: MetadataCache::new(settings.store.metadata_ttl()),
            workers: Arc::new(Semaphore::new(settings.ingestion.workers.max(1))),
            chunker: Arc::new(chunker),
            locks: DocumentLocks::new(),
            collection_tokens: DashMap::new(),
            in_flight: DashMap::new(),
            settings,
            registry,
            store,
            embedder,
            loaders,
            provider,
            fetcher,
            policy,
        })
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Ingest one document.
    ///
    /// Stage failures come back as `Ok` with a `failed` record. `Err` is
    /// reserved for requests that never started: a document id owned by
    /// another collection, or `IngestionInProgress` under the `fail` policy.
    pub async fn ingest(
        &self,
        collection: &CollectionId,
        request: DocumentRequest,
    ) -> RagResult<DocumentRecord> {
        self.ingest_with_policy(collection, request, self.settings.ingestion.on_conflict)
            .await
    }

    pub async fn ingest_with_policy(
        &self,
        collection: &CollectionId,
        request: DocumentRequest,
        policy: ConflictPolicy,
    ) -> RagResult<DocumentRecord> {
        self.check_owner(collection, &request.id)?;
        let id = request.id.clone();

        // A record already in flight keeps reporting that ingestion
        let previous = self.registry.get(&id);
        let queued = previous.as_ref().is_none_or(|r| r.status.is_terminal());
        if queued {
            self.registry
                .put(DocumentRecord::pending(collection.clone(), &request));
        }

        let _guard = match self.locks.acquire(&id, policy).await {
            Ok(guard) => guard,
            Err(err) => {
                if queued {
                    self.restore(&id, previous);
                }
                return Err(err);
            }
        };
        // Ownership may have changed while waiting
        self.check_owner(collection, &id)?;
        self.registry
            .put(DocumentRecord::pending(collection.clone(), &request));

        let token = self.collection_token(collection).child_token();
        self.in_flight.insert(id.clone(), token.clone());

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(RagError::Cancelled(format!("ingestion of '{id}'"))),
            outcome = self.run(collection, &request, &token) => outcome,
        };
        self.in_flight.remove(&id);

        let record = match result {
            Ok(outcome) => {
                tracing::info!(
                    target: "collection",
                    "'{id}' ready with {} chunks",
                    outcome.chunk_count
                );
                self.registry.update(&id, |r| {
                    r.status = DocumentStatus::Ready;
                    r.text_len = outcome.text_len;
                    r.chunk_count = outcome.chunk_count;
                    r.content_hash = Some(outcome.content_hash);
                    r.title = outcome.title;
                    r.error = None;
                })
            }
            Err(err) => {
                tracing::warn!(target: "collection", "ingestion of '{id}' failed: {err}");
                self.cleanup(collection, &id).await;
                let detail = FailureDetail::from(&err);
                self.registry.update(&id, |r| {
                    r.status = DocumentStatus::Failed;
                    r.chunk_count = 0;
                    r.error = Some(detail);
                })
            }
        };

        record.ok_or_else(|| RagError::NotFound(format!("document '{id}'")))
    }

    /// Ingest several documents concurrently. Every request gets its own
    /// result, in request order.
    pub async fn ingest_batch(
        &self,
        collection: &CollectionId,
        requests: Vec<DocumentRequest>,
    ) -> Vec<RagResult<DocumentRecord>> {
        let tasks = requests
            .into_iter()
            .map(|request| self.ingest(collection, request));
        futures_util::future::join_all(tasks).await
    }

    pub fn ingest_status(&self, id: &DocumentId) -> RagResult<DocumentRecord> {
        self.registry
            .get(id)
            .ok_or_else(|| RagError::NotFound(format!("document '{id}'")))
    }

    pub fn list_documents(&self, collection: &CollectionId) -> Vec<DocumentRecord> {
        self.registry.list(collection)
    }

    /// Remove a document and all its chunks.
    ///
    /// An in-flight ingestion of the document is cancelled and drained first.
    /// Returns once the backend no longer reports the document.
    pub async fn delete_document(
        &self,
        collection: &CollectionId,
        id: &DocumentId,
    ) -> RagResult<usize> {
        let record = self.registry.get(id);
        if record.as_ref().is_some_and(|r| &r.collection != collection) {
            return Err(RagError::NotFound(format!(
                "document '{id}' in collection '{collection}'"
            )));
        }

        if let Some(token) = self.in_flight.get(id).map(|t| t.clone()) {
            tracing::debug!(target: "collection", "cancelling in-flight ingestion of '{id}'");
            token.cancel();
        }
        let _guard = self.locks.acquire(id, ConflictPolicy::Wait).await?;

        let filter = Filter::document(id.clone());
        let removed = match retry(&self.policy, "delete", || {
            self.store.delete(collection, &filter)
        })
        .await
        {
            Ok(removed) => removed,
            Err(RagError::NotFound(_)) => 0,
            Err(err) => return Err(err),
        };

        self.await_removal(&format!("document '{id}'"), || async {
            match self.store.document_exists(collection, id).await {
                Err(RagError::NotFound(_)) => Ok(false),
                other => other,
            }
        })
        .await?;

        self.registry.remove(id);
        if record.is_none() && removed == 0 {
            return Err(RagError::NotFound(format!(
                "document '{id}' in collection '{collection}'"
            )));
        }

        tracing::info!(target: "collection", "deleted '{id}' ({removed} chunks) from '{collection}'");
        Ok(removed)
    }

    /// Drop a collection with every document and chunk in it.
    ///
    /// Returns the ids of the documents that were registered in it.
    pub async fn delete_collection(&self, collection: &CollectionId) -> RagResult<Vec<DocumentId>> {
        if let Some((_, token)) = self.collection_tokens.remove(collection) {
            token.cancel();
        }

        // Drain in-flight ingestions so their cleanup runs before the drop
        for id in self.registry.members(collection) {
            drop(self.locks.acquire(&id, ConflictPolicy::Wait).await?);
        }

        retry(&self.policy, "drop collection", || {
            self.store.drop_collection(collection)
        })
        .await?;
        self.cache.invalidate(collection);

        self.await_removal(&format!("collection '{collection}'"), || async {
            Ok(self.store.collection_info(collection).await?.is_some())
        })
        .await?;

        let removed = self.registry.remove_collection(collection);
        tracing::info!(
            target: "collection",
            "deleted collection '{collection}' with {} documents",
            removed.len()
        );
        Ok(removed)
    }

    fn check_owner(&self, collection: &CollectionId, id: &DocumentId) -> RagResult<()> {
        match self.registry.get(id) {
            Some(record) if &record.collection != collection => Err(RagError::InvalidConfig(
                format!(
                    "document '{id}' already belongs to collection '{}'",
                    record.collection
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Put back the record a rejected request displaced.
    fn restore(&self, id: &DocumentId, previous: Option<DocumentRecord>) {
        match previous {
            Some(record) => self.registry.put(record),
            None => {
                self.registry.remove(id);
            }
        }
    }

    fn collection_token(&self, collection: &CollectionId) -> CancellationToken {
        self.collection_tokens
            .entry(collection.clone())
            .or_default()
            .clone()
    }

    /// Wait for a worker slot, then run the stages.
    async fn run(
        &self,
        collection: &CollectionId,
        request: &DocumentRequest,
        token: &CancellationToken,
    ) -> RagResult<IngestOutcome> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| RagError::Cancelled("ingestion pool closed".to_string()))?;
        self.registry
            .update(&request.id, |r| r.status = DocumentStatus::Processing);

        tracing::info!(
            target: "collection",
            "ingesting '{}' into '{collection}' from {}",
            request.id,
            request.source
        );
        self.process(collection, request, token).await
    }

    async fn process(
        &self,
        collection: &CollectionId,
        request: &DocumentRequest,
        token: &CancellationToken,
    ) -> RagResult<IngestOutcome> {
        let (fetched, served_mime) = self.fetch(&request.source).await?;
        let mime = if request.mime.trim().is_empty() {
            served_mime.unwrap_or_default()
        } else {
            request.mime.clone()
        };
        checkpoint(token, "loading")?;

        let loaded = self.load(fetched, mime.clone()).await?;
        let content_hash = sha256_hex(&loaded.text);
        checkpoint(token, "chunking")?;

        self.ensure_collection(collection).await?;
        let filter = Filter::document(request.id.clone());
        let stale = retry(&self.policy, "delete", || self.store.delete(collection, &filter)).await?;
        if stale > 0 {
            tracing::debug!(
                target: "collection",
                "removed {stale} chunks from a previous ingestion of '{}'",
                request.id
            );
        }

        let title = request.title.clone().or_else(|| loaded.title.clone());
        let base = base_metadata(request, &mime, title.as_deref());
        let batch_size = self.embedder.max_batch_size().max(1);
        let mut cursor = self.chunker.spans(&loaded.text, &loaded.structure);
        let mut chunk_count = 0;

        loop {
            let spans: Vec<ChunkSpan> = cursor.by_ref().take(batch_size).collect();
            if spans.is_empty() {
                break;
            }
            checkpoint(token, "embedding")?;

            let texts: Vec<String> = spans
                .iter()
                .map(|span| span.text(&loaded.text).to_string())
                .collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            checkpoint(token, "upserting")?;

            let chunks: Vec<StoredChunk> = spans
                .iter()
                .zip(texts)
                .zip(vectors)
                .map(|((span, text), vector)| StoredChunk {
                    identity: ChunkIdentity::new(request.id.clone(), span.seq),
                    span: span.as_text_span(),
                    text,
                    metadata: chunk_metadata(&base, &loaded, span),
                    vector,
                })
                .collect();

            self.upsert(collection, &chunks).await?;
            chunk_count += chunks.len();
        }

        Ok(IngestOutcome {
            text_len: loaded.text.len(),
            chunk_count,
            content_hash,
            title,
        })
    }

    async fn fetch(&self, source: &SourceRef) -> RagResult<(Fetched, Option<String>)> {
        match source {
            SourceRef::Inline(text) => Ok((Fetched::Bytes(text.clone().into_bytes()), None)),
            SourceRef::Key(key) => {
                let present =
                    retry(&self.policy, "storage exists", || self.provider.exists(key)).await?;
                if !present {
                    return Err(RagError::SourceUnavailable {
                        key: key.clone(),
                        reason: "no such key".to_string(),
                    });
                }
                let reader = retry(&self.policy, "storage open", || self.provider.open(key)).await?;
                Ok((Fetched::Reader(reader), None))
            }
            SourceRef::Url(url) => {
                let max_bytes = self.loaders.max_bytes();
                let (body, content_type) =
                    retry(&self.policy, "fetch", || self.fetcher.fetch(url, max_bytes)).await?;
                Ok((Fetched::Bytes(body), content_type))
            }
        }
    }

    async fn load(&self, fetched: Fetched, mime: String) -> RagResult<LoadedDocument> {
        let loaders = self.loaders.clone();
        tokio::task::spawn_blocking(move || match fetched {
            Fetched::Bytes(bytes) => loaders.load(&bytes, &mime),
            Fetched::Reader(reader) => loaders.load_reader(reader, &mime),
        })
        .await
        .map_err(|e| RagError::corrupt(format!("loader task failed: {e}")))?
    }

    /// Confirm the collection exists with the embedder's dimension.
    ///
    /// A cached entry with a different dimension is revalidated against the
    /// backend before the conflict is reported.
    async fn ensure_collection(&self, collection: &CollectionId) -> RagResult<CollectionInfo> {
        let dimension = self.embedder.dimension();
        if let Some(info) = self.cache.get(collection) {
            if info.dimension == dimension {
                return Ok(info);
            }
            self.cache.invalidate(collection);
        }

        let result = retry(&self.policy, "ensure collection", || {
            self.store.ensure_collection(collection, dimension)
        })
        .await;
        match result {
            Ok(info) => {
                self.cache.insert(info.clone());
                Ok(info)
            }
            Err(err) => {
                if matches!(err, RagError::DimensionalityConflict { .. }) {
                    self.cache.invalidate(collection);
                }
                Err(err)
            }
        }
    }

    async fn upsert(&self, collection: &CollectionId, chunks: &[StoredChunk]) -> RagResult<()> {
        let result = retry(&self.policy, "upsert", || self.store.upsert(collection, chunks)).await;
        if let Err(RagError::DimensionalityConflict { .. }) = &result {
            self.cache.invalidate(collection);
        }
        result
    }

    /// Best-effort removal of chunks a failed ingestion may have written.
    async fn cleanup(&self, collection: &CollectionId, id: &DocumentId) {
        let filter = Filter::document(id.clone());
        let once = RetryPolicy::once(self.policy.call_timeout);
        match retry(&once, "cleanup", || self.store.delete(collection, &filter)).await {
            Ok(0) | Err(RagError::NotFound(_)) => {}
            Ok(removed) => {
                tracing::debug!(target: "collection", "cleaned up {removed} chunks of '{id}'");
            }
            Err(err) => {
                tracing::error!(
                    target: "collection",
                    "cleanup of '{id}' in '{collection}' failed, stale chunks may remain: {err}"
                );
            }
        }
    }

    /// Poll `still_present` until it reports false or the attempts run out.
    async fn await_removal<F, Fut>(&self, what: &str, mut still_present: F) -> RagResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RagResult<bool>>,
    {
        let attempts = self.settings.store.delete_poll_attempts.max(1);
        let interval = self.settings.store.delete_poll_interval();
        for attempt in 1..=attempts {
            if !still_present().await? {
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        tracing::error!(
            target: "collection",
            "{what} still visible in {} after {attempts} checks",
            self.store.name()
        );
        Err(RagError::BackendUnavailable(format!(
            "{what} still visible after delete"
        )))
    }
}

fn checkpoint(token: &CancellationToken, stage: &str) -> RagResult<()> {
    if token.is_cancelled() {
        return Err(RagError::Cancelled(format!("ingestion cancelled before {stage}")));
    }
    Ok(())
}

fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn source_label(source: &SourceRef) -> String {
    match source {
        SourceRef::Key(key) => key.clone(),
        SourceRef::Url(url) => url.clone(),
        SourceRef::Inline(_) => "inline".to_string(),
    }
}

/// Metadata shared by every chunk of one document.
fn base_metadata(request: &DocumentRequest, mime: &str, title: Option<&str>) -> Metadata {
    let mut metadata = request.tags.clone();
    metadata.insert(meta_keys::DOCUMENT_ID.into(), request.id.as_str().into());
    metadata.insert(meta_keys::SOURCE.into(), source_label(&request.source).into());
    metadata.insert(meta_keys::MIME.into(), mime.into());
    metadata.insert(
        meta_keys::INGESTED_AT.into(),
        chrono::Utc::now().to_rfc3339().into(),
    );
    if let Some(title) = title {
        metadata.insert(meta_keys::TITLE.into(), title.into());
    }
    metadata
}

fn chunk_metadata(base: &Metadata, loaded: &LoadedDocument, span: &ChunkSpan) -> Metadata {
    let mut metadata = base.clone();
    if let Some(page) = loaded.structure.page_at(span.start) {
        metadata.insert(meta_keys::PAGE.into(), MetaValue::Int(i64::from(page)));
    }
    if let Some(section) = loaded.structure.section_at(span.start) {
        metadata.insert(meta_keys::SECTION.into(), section.into());
    }
    metadata
}
