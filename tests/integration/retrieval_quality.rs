//! Ranking, cutoff and degradation behavior of queries.

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use groundwork::config::StoreBackend;
use groundwork::store::{Capabilities, CollectionInfo, Filter, MemoryStore, ScoredChunk, StoredChunk};
use groundwork::{
    AccessScope, ChunkIdentity, CollectionId, DocumentRequest, ErrorKind, QueryRequest, RagError,
    RagResult, SourceRef, VectorStore,
};

use crate::support::{pipeline, settings};

/// Memory store whose searches fail for one collection.
struct FlakyStore {
    inner: MemoryStore,
    down: CollectionId,
}

impl FlakyStore {
    fn check(&self, collection: &CollectionId) -> RagResult<()> {
        if *collection == self.down {
            return Err(RagError::BackendUnavailable(format!(
                "{collection} is unreachable"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn ensure_collection(
        &self,
        collection: &CollectionId,
        dimension: usize,
    ) -> RagResult<CollectionInfo> {
        self.inner.ensure_collection(collection, dimension).await
    }

    async fn collection_info(
        &self,
        collection: &CollectionId,
    ) -> RagResult<Option<CollectionInfo>> {
        self.inner.collection_info(collection).await
    }

    async fn drop_collection(&self, collection: &CollectionId) -> RagResult<()> {
        self.inner.drop_collection(collection).await
    }

    async fn upsert(&self, collection: &CollectionId, chunks: &[StoredChunk]) -> RagResult<()> {
        self.inner.upsert(collection, chunks).await
    }

    async fn delete(&self, collection: &CollectionId, filter: &Filter) -> RagResult<usize> {
        self.inner.delete(collection, filter).await
    }

    async fn list_identities(
        &self,
        collection: &CollectionId,
        filter: &Filter,
    ) -> RagResult<Vec<ChunkIdentity>> {
        self.inner.list_identities(collection, filter).await
    }

    async fn count(&self, collection: &CollectionId) -> RagResult<usize> {
        self.inner.count(collection).await
    }

    async fn query(
        &self,
        collection: &CollectionId,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> RagResult<Vec<ScoredChunk>> {
        self.check(collection)?;
        self.inner.query(collection, vector, k, filter).await
    }
}

const TIDE_DOCS: [(&str, &str); 3] = [
    ("tide-1", "tide pool ecology"),
    ("tide-2", "tide pool ecology survey"),
    ("tide-3", "tide pool ecology primer"),
];

const OTHER_DOCS: [(&str, &str); 5] = [
    ("bread", "sourdough starter hydration schedule"),
    ("bikes", "derailleur cable tension adjustment"),
    ("tax", "quarterly estimated payment deadlines"),
    ("chess", "sicilian defense opening theory"),
    ("garden", "compost turning moisture balance"),
];

#[tokio::test]
async fn test_k_is_a_ceiling_not_a_quota() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path(), StoreBackend::Memory);
    settings.retrieval.relevance_cutoff = 0.5;
    settings.retrieval.hybrid_enabled = false;
    let pipeline = pipeline(settings, Arc::new(MemoryStore::new()));
    let kb = CollectionId::new("kb");
    let scope = AccessScope::any();

    for (id, text) in TIDE_DOCS.iter().chain(OTHER_DOCS.iter()) {
        pipeline
            .ingest(&scope, &kb, DocumentRequest::inline(*id, *text))
            .await
            .unwrap();
    }

    let result = pipeline
        .query(
            &scope,
            &QueryRequest::new(vec![kb], "tide pool ecology").with_k(5),
        )
        .await
        .unwrap();

    assert_eq!(result.matches.len(), 3);
    assert!(!result.partial);
    assert!(
        result
            .matches
            .iter()
            .all(|m| m.identity.document_id.as_str().starts_with("tide"))
    );
    // The exact phrase ranks first
    assert_eq!(result.matches[0].identity.document_id.as_str(), "tide-1");
    for pair in result.matches.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn test_collection_order_does_not_change_ranking() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(
        settings(dir.path(), StoreBackend::Memory),
        Arc::new(MemoryStore::new()),
    );
    let scope = AccessScope::any();
    let notes = CollectionId::new("notes");
    let manuals = CollectionId::new("manuals");

    for (collection, id, text) in [
        (&notes, "n1", "harbor crane inspection checklist"),
        (&notes, "n2", "harbor tug schedule"),
        (&manuals, "m1", "crane hydraulic inspection manual"),
        (&manuals, "m2", "crane operator certification"),
    ] {
        pipeline
            .ingest(&scope, collection, DocumentRequest::inline(id, text))
            .await
            .unwrap();
    }

    let ranked = |collections: Vec<CollectionId>| {
        let pipeline = &pipeline;
        let scope = &scope;
        async move {
            pipeline
                .query(scope, &QueryRequest::new(collections, "crane inspection"))
                .await
                .unwrap()
                .matches
                .into_iter()
                .map(|m| (m.collection, m.identity))
                .collect::<Vec<_>>()
        }
    };

    let forward = ranked(vec![notes.clone(), manuals.clone()]).await;
    let backward = ranked(vec![manuals.clone(), notes.clone()]).await;
    assert!(!forward.is_empty());
    assert_eq!(forward, backward);
    assert!(forward.iter().any(|(c, _)| *c == notes));
    assert!(forward.iter().any(|(c, _)| *c == manuals));
}

#[tokio::test]
async fn test_unreachable_collection_degrades_result() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path(), StoreBackend::Memory);
    settings.retry.max_attempts = 2;
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        down: CollectionId::new("archive"),
    });
    let pipeline = pipeline(settings, store);
    let scope = AccessScope::any();
    let live = CollectionId::new("live");
    let archive = CollectionId::new("archive");

    for collection in [&live, &archive] {
        let id = format!("{collection}-doc");
        pipeline
            .ingest(
                &scope,
                collection,
                DocumentRequest::inline(id.as_str(), "glacier melt rates"),
            )
            .await
            .unwrap();
    }

    let result = pipeline
        .query(
            &scope,
            &QueryRequest::new(vec![live.clone(), archive.clone()], "glacier melt"),
        )
        .await
        .unwrap();
    assert!(result.partial);
    assert_eq!(result.failed_collections.len(), 1);
    assert_eq!(result.failed_collections[0].collection, archive);
    assert_eq!(
        result.failed_collections[0].error.kind,
        ErrorKind::BackendUnavailable
    );
    assert!(result.matches.iter().all(|m| m.collection == live));
    assert!(!result.matches.is_empty());

    let err = pipeline
        .query(&scope, &QueryRequest::new(vec![archive], "glacier"))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::RetrievalUnavailable(_)));
}

#[tokio::test]
async fn test_citations_carry_markdown_structure() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(
        settings(dir.path(), StoreBackend::Memory),
        Arc::new(MemoryStore::new()),
    );
    let scope = AccessScope::any();
    let kb = CollectionId::new("kb");
    let markdown = "# Field Guide\n\n## Anchoring\n\nDrop anchor in sand, never on coral reefs.\n";

    pipeline
        .ingest(
            &scope,
            &kb,
            DocumentRequest::new(
                "guide",
                SourceRef::Inline(markdown.to_string()),
                "text/markdown",
            )
            .with_title("Sailing handbook"),
        )
        .await
        .unwrap();

    let result = pipeline
        .query(&scope, &QueryRequest::new(vec![kb], "anchor coral"))
        .await
        .unwrap();
    let top = &result.matches[0];
    assert_eq!(top.citation.document_id.as_str(), "guide");
    assert_eq!(top.citation.title.as_deref(), Some("Sailing handbook"));
    assert_eq!(top.citation.seq, top.identity.seq);
    assert!(top.text.contains("coral"));
}
