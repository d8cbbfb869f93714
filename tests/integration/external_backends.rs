//! Backends that need a server or a model download.
//!
//! Run with `cargo test -- --ignored` once the services are available:
//! - Qdrant at `GW_TEST_QDRANT_URL` (default `http://localhost:6333`)
//! - fastembed models are downloaded into the default cache on first use

use std::sync::Arc;
use tempfile::TempDir;

use groundwork::config::{EmbeddingBackend, RerankKind, StoreBackend};
use groundwork::store::{QdrantStore, StoredChunk};
use groundwork::types::{Metadata, TextSpan};
use groundwork::{
    AccessScope, ChunkIdentity, CollectionId, DocumentRequest, DocumentStatus, Filter,
    MemoryStorageProvider, Pipeline, QueryRequest, VectorStore,
};

use crate::support::settings;

fn qdrant_url() -> String {
    std::env::var("GW_TEST_QDRANT_URL").unwrap_or_else(|_| "http://localhost:6333".to_string())
}

#[tokio::test]
#[ignore = "requires a running Qdrant server"]
async fn test_qdrant_upsert_query_delete() {
    let store = QdrantStore::new(&qdrant_url(), None).unwrap();
    let collection = CollectionId::new(format!("groundwork-test-{}", uuid::Uuid::new_v4()));
    store.ensure_collection(&collection, 3).await.unwrap();

    let chunk = |doc: &str, seq: u32, vector: Vec<f32>| StoredChunk {
        identity: ChunkIdentity::new(doc.into(), seq),
        span: TextSpan::new(0, 4),
        text: format!("{doc} {seq}"),
        metadata: Metadata::new(),
        vector,
    };
    store
        .upsert(
            &collection,
            &[
                chunk("a", 0, vec![1.0, 0.0, 0.0]),
                chunk("b", 0, vec![0.0, 1.0, 0.0]),
            ],
        )
        .await
        .unwrap();

    let hits = store
        .query(&collection, &[1.0, 0.0, 0.0], 1, None)
        .await
        .unwrap();
    assert_eq!(hits[0].identity.document_id.as_str(), "a");

    store
        .delete(&collection, &Filter::document("a".into()))
        .await
        .unwrap();
    let mut gone = false;
    for _ in 0..20 {
        if !store.document_exists(&collection, &"a".into()).await.unwrap() {
            gone = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(gone);
    store.drop_collection(&collection).await.unwrap();
}

#[tokio::test]
#[ignore = "downloads fastembed models"]
async fn test_local_models_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path(), StoreBackend::Memory);
    settings.embedding.backend = EmbeddingBackend::Fastembed;
    settings.embedding.dimension = 384;
    settings.retrieval.rerank = RerankKind::CrossEncoder;

    let pipeline = Pipeline::with_provider(
        Arc::new(settings),
        Arc::new(MemoryStorageProvider::new()),
    )
    .await
    .unwrap();
    let kb = CollectionId::new("kb");
    let scope = AccessScope::any();

    for (id, text) in [
        ("rust", "Rust guarantees memory safety without a garbage collector."),
        ("bread", "Knead the dough until it passes the windowpane test."),
    ] {
        let record = pipeline
            .ingest(&scope, &kb, DocumentRequest::inline(id, text))
            .await
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Ready);
    }

    let result = pipeline
        .query(
            &scope,
            &QueryRequest::new(vec![kb], "How does Rust manage memory?"),
        )
        .await
        .unwrap();
    assert_eq!(result.matches[0].identity.document_id.as_str(), "rust");
    assert!(result.matches[0].rerank_score.is_some());
}
