//! Ingestion, re-ingestion and deletion through the pipeline façade.

use std::sync::Arc;
use tempfile::TempDir;

use groundwork::config::{ChunkingConfig, StoreBackend};
use groundwork::store::{Filter, MemoryStore};
use groundwork::types::{MetaValue, meta_keys};
use groundwork::{
    AccessScope, CollectionId, DocumentId, DocumentRequest, DocumentStatus, ErrorKind,
    HashingEmbedder, MemoryStorageProvider, QueryRequest, RagError, SourceRef, VectorStore,
};

use crate::support::{
    DIM, LOCAL_BACKENDS, open_store, pipeline, pipeline_with_provider, settings, words,
};

#[tokio::test]
async fn test_paged_document_becomes_ready() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path(), StoreBackend::Memory);
    settings.chunking = ChunkingConfig::new(1000, 100);

    let provider = Arc::new(MemoryStorageProvider::new());
    let text = [words("a", 3000), words("b", 3000), words("c", 3000)].join("\u{000C}");
    provider.put("reports/annual.txt", text);

    let store = open_store(StoreBackend::Memory, dir.path()).await;
    let pipeline = pipeline_with_provider(settings, store.clone(), provider);
    let kb = CollectionId::new("kb");

    let record = pipeline
        .ingest(
            &AccessScope::any(),
            &kb,
            DocumentRequest::new(
                "annual",
                SourceRef::Key("reports/annual.txt".to_string()),
                "text/plain",
            ),
        )
        .await
        .unwrap();

    assert_eq!(record.status, DocumentStatus::Ready);
    assert_eq!(record.chunk_count, 10);
    assert!(record.error.is_none());
    assert_eq!(store.count(&kb).await.unwrap(), 10);
    assert_eq!(
        store.collection_info(&kb).await.unwrap().unwrap().dimension,
        DIM
    );

    let mut seqs: Vec<u32> = store
        .list_identities(&kb, &Filter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|identity| identity.seq)
        .collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());

    // The last window starts on the third page
    let probe = HashingEmbedder::new(DIM).embed_text(&words("c", 3000));
    let hits = store.query(&kb, &probe, 10, None).await.unwrap();
    let last = hits.iter().find(|hit| hit.identity.seq == 9).unwrap();
    assert_eq!(last.metadata.get(meta_keys::PAGE), Some(&MetaValue::Int(3)));
    let first = hits.iter().find(|hit| hit.identity.seq == 0).unwrap();
    assert_eq!(first.metadata.get(meta_keys::PAGE), Some(&MetaValue::Int(1)));
}

#[tokio::test]
async fn test_batch_isolates_failures() {
    let dir = TempDir::new().unwrap();
    let store = open_store(StoreBackend::Memory, dir.path()).await;
    let pipeline = pipeline(settings(dir.path(), StoreBackend::Memory), store.clone());
    let kb = CollectionId::new("kb");

    let results = pipeline
        .ingest_batch(
            &AccessScope::any(),
            &kb,
            vec![
                DocumentRequest::inline("good", words("fine", 100)),
                DocumentRequest::new(
                    "binary",
                    SourceRef::Inline("MZ\u{0090}".to_string()),
                    "application/x-msdownload",
                ),
                DocumentRequest::new(
                    "missing",
                    SourceRef::Key("nowhere.txt".to_string()),
                    "text/plain",
                ),
            ],
        )
        .await
        .unwrap();

    let records: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(records[0].status, DocumentStatus::Ready);
    assert_eq!(records[1].status, DocumentStatus::Failed);
    assert_eq!(
        records[1].error.as_ref().unwrap().kind,
        ErrorKind::UnsupportedType
    );
    assert_eq!(records[2].status, DocumentStatus::Failed);
    assert_eq!(
        records[2].error.as_ref().unwrap().kind,
        ErrorKind::SourceUnavailable
    );

    assert_eq!(store.count(&kb).await.unwrap(), records[0].chunk_count);
    let listed = pipeline.list_documents(&AccessScope::any(), &kb).unwrap();
    assert_eq!(listed.len(), 3);
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    for backend in LOCAL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let store = open_store(backend, dir.path()).await;
        let pipeline = pipeline(settings(dir.path(), backend), store.clone());
        let kb = CollectionId::new("kb");
        let scope = AccessScope::any();
        let text = words("stable", 150);

        let first = pipeline
            .ingest(&scope, &kb, DocumentRequest::inline("doc", text.as_str()))
            .await
            .unwrap();
        let mut before = store.list_identities(&kb, &Filter::default()).await.unwrap();
        before.sort();

        let second = pipeline
            .ingest(&scope, &kb, DocumentRequest::inline("doc", text.as_str()))
            .await
            .unwrap();
        let mut after = store.list_identities(&kb, &Filter::default()).await.unwrap();
        after.sort();

        assert_eq!(second.status, DocumentStatus::Ready, "{backend:?}");
        assert_eq!(first.chunk_count, second.chunk_count, "{backend:?}");
        assert_eq!(first.content_hash, second.content_hash, "{backend:?}");
        assert_eq!(before, after, "{backend:?}");

        // Shorter content drops the stale tail
        let shrunk = pipeline
            .ingest(&scope, &kb, DocumentRequest::inline("doc", words("stable", 30)))
            .await
            .unwrap();
        assert!(shrunk.chunk_count < first.chunk_count);
        assert_eq!(
            store.count(&kb).await.unwrap(),
            shrunk.chunk_count,
            "{backend:?}"
        );
    }
}

#[tokio::test]
async fn test_deleted_document_never_returned() {
    for backend in LOCAL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let store = open_store(backend, dir.path()).await;
        let pipeline = pipeline(settings(dir.path(), backend), store.clone());
        let kb = CollectionId::new("kb");
        let scope = AccessScope::any();

        for (id, text) in [
            ("old", "lighthouse keeper logbook and storm records"),
            ("new", "lighthouse lamp maintenance and storm shutters"),
        ] {
            pipeline
                .ingest(&scope, &kb, DocumentRequest::inline(id, text))
                .await
                .unwrap();
        }

        let removed = pipeline
            .delete_document(&scope, &kb, &DocumentId::new("old"))
            .await
            .unwrap();
        assert!(removed > 0, "{backend:?}");

        let result = pipeline
            .query(&scope, &QueryRequest::new(vec![kb.clone()], "lighthouse storm"))
            .await
            .unwrap();
        assert!(
            result
                .matches
                .iter()
                .all(|m| m.identity.document_id.as_str() != "old"),
            "{backend:?}"
        );
        assert!(
            result
                .matches
                .iter()
                .any(|m| m.identity.document_id.as_str() == "new"),
            "{backend:?}"
        );

        assert!(matches!(
            pipeline.ingest_status(&scope, &DocumentId::new("old")),
            Err(RagError::NotFound(_))
        ));
        assert!(matches!(
            pipeline
                .delete_document(&scope, &kb, &DocumentId::new("old"))
                .await,
            Err(RagError::NotFound(_))
        ));
    }
}

#[tokio::test]
async fn test_delete_collection_empties_everything() {
    for backend in LOCAL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let store = open_store(backend, dir.path()).await;
        let pipeline = pipeline(settings(dir.path(), backend), store.clone());
        let kb = CollectionId::new("kb");
        let scope = AccessScope::any();

        for id in ["one", "two"] {
            pipeline
                .ingest(&scope, &kb, DocumentRequest::inline(id, words(id, 60)))
                .await
                .unwrap();
        }

        let mut removed = pipeline.delete_collection(&scope, &kb).await.unwrap();
        removed.sort();
        assert_eq!(removed, vec![DocumentId::new("one"), DocumentId::new("two")]);
        assert!(store.collection_info(&kb).await.unwrap().is_none(), "{backend:?}");
        assert!(pipeline.list_documents(&scope, &kb).unwrap().is_empty());

        let result = pipeline
            .query(&scope, &QueryRequest::new(vec![kb.clone()], "one0"))
            .await
            .unwrap();
        assert!(result.matches.is_empty());
        assert!(!result.partial);
    }
}

#[tokio::test]
async fn test_dimension_conflict_leaves_collection_untouched() {
    let dir = TempDir::new().unwrap();
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let kb = CollectionId::new("kb");
    let scope = AccessScope::any();

    let wide = pipeline(settings(dir.path(), StoreBackend::Memory), store.clone());
    let kept = wide
        .ingest(&scope, &kb, DocumentRequest::inline("kept", words("kept", 80)))
        .await
        .unwrap();

    let mut narrow_settings = settings(dir.path(), StoreBackend::Memory);
    narrow_settings.embedding.dimension = 64;
    let narrow = pipeline(narrow_settings, store.clone());
    let record = narrow
        .ingest(&scope, &kb, DocumentRequest::inline("intruder", words("x", 80)))
        .await
        .unwrap();

    assert_eq!(record.status, DocumentStatus::Failed);
    assert_eq!(
        record.error.unwrap().kind,
        ErrorKind::DimensionalityConflict
    );
    assert_eq!(store.count(&kb).await.unwrap(), kept.chunk_count);
    assert_eq!(
        store.collection_info(&kb).await.unwrap().unwrap().dimension,
        DIM
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingests_are_all_persisted() {
    let dir = TempDir::new().unwrap();
    let backend = StoreBackend::Sqlite;
    let store = open_store(backend, dir.path()).await;
    let pipeline = pipeline(settings(dir.path(), backend), store);
    let kb = CollectionId::new("kb");
    let scope = AccessScope::any();

    let ingests = (0..64).map(|i| {
        let id = DocumentId::new(format!("doc-{i}"));
        pipeline.ingest(&scope, &kb, DocumentRequest::inline(id, words(&format!("w{i}-"), 30)))
    });
    let records = futures_util::future::join_all(ingests).await;
    assert!(
        records
            .iter()
            .all(|r| r.as_ref().unwrap().status == DocumentStatus::Ready)
    );
    drop(pipeline);

    let store = open_store(backend, dir.path()).await;
    let reopened = crate::support::pipeline(settings(dir.path(), backend), store);
    let listed = reopened.list_documents(&scope, &kb).unwrap();
    assert_eq!(listed.len(), 64);
    assert!(listed.iter().all(|r| r.status == DocumentStatus::Ready));
}
