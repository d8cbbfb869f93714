//! Behavior every local backend must share when driven through the pipeline.

use tempfile::TempDir;

use groundwork::config::StoreBackend;
use groundwork::store::Filter;
use groundwork::{AccessScope, CollectionId, DocumentRequest, DocumentStatus, QueryRequest};

use crate::support::{DIM, LOCAL_BACKENDS, open_store, pipeline, settings};

#[tokio::test]
async fn test_metadata_filter_on_every_backend() {
    for backend in LOCAL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let store = open_store(backend, dir.path()).await;
        let pipeline = pipeline(settings(dir.path(), backend), store);
        let kb = CollectionId::new("kb");
        let scope = AccessScope::any();

        for (id, team) in [("search-runbook", "search"), ("ops-runbook", "ops")] {
            pipeline
                .ingest(
                    &scope,
                    &kb,
                    DocumentRequest::inline(id, "pager rotation and incident escalation steps")
                        .with_tag("team", team),
                )
                .await
                .unwrap();
        }

        let request = QueryRequest::new(vec![kb.clone()], "incident escalation")
            .with_filter(Filter::default().with_equals("team", "search"));
        let result = pipeline.query(&scope, &request).await.unwrap();

        assert!(!result.matches.is_empty(), "{backend:?}");
        assert!(
            result
                .matches
                .iter()
                .all(|m| m.identity.document_id.as_str() == "search-runbook"),
            "{backend:?}"
        );
    }
}

#[tokio::test]
async fn test_persistent_backends_survive_restart() {
    for backend in [StoreBackend::Sqlite, StoreBackend::Tantivy] {
        let dir = TempDir::new().unwrap();
        let kb = CollectionId::new("kb");
        let scope = AccessScope::any();

        {
            let store = open_store(backend, dir.path()).await;
            let pipeline = pipeline(settings(dir.path(), backend), store);
            let record = pipeline
                .ingest(
                    &scope,
                    &kb,
                    DocumentRequest::inline("almanac", "frost dates and planting windows"),
                )
                .await
                .unwrap();
            assert_eq!(record.status, DocumentStatus::Ready);
        }

        let store = open_store(backend, dir.path()).await;
        assert_eq!(
            store.collection_info(&kb).await.unwrap().unwrap().dimension,
            DIM,
            "{backend:?}"
        );
        let pipeline = pipeline(settings(dir.path(), backend), store);
        let record = pipeline
            .ingest_status(&scope, &"almanac".into())
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Ready, "{backend:?}");

        let result = pipeline
            .query(&scope, &QueryRequest::new(vec![kb.clone()], "frost planting"))
            .await
            .unwrap();
        assert_eq!(
            result.matches[0].identity.document_id.as_str(),
            "almanac",
            "{backend:?}"
        );
    }
}
