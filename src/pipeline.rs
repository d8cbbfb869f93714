//! Outward façade: the five pipeline operations behind an access scope.
//!
//! The host application authenticates callers and hands in the collection
//! ids each caller may touch. The pipeline trusts that set and adds no ACL
//! logic of its own; a collection outside the scope is reported as
//! `NotFound` so callers cannot probe for its existence.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::collection::{CollectionManager, DocumentRegistry};
use crate::config::{Settings, StoreBackend};
use crate::embed::{Embedder, build_embedder};
use crate::error::{RagError, RagResult};
use crate::loader::LoaderRegistry;
use crate::retrieve::{QueryRequest, QueryResult, Reranker, Retriever, build_reranker};
use crate::retry::RetryPolicy;
use crate::storage_provider::{FsStorageProvider, StorageProvider};
use crate::store::{VectorStore, open_store};
use crate::types::{CollectionId, DocumentId, DocumentRecord, DocumentRequest};

const REGISTRY_FILE: &str = "documents.json";

/// Collections a caller has proven access to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessScope {
    /// `None` grants every collection
    collections: Option<BTreeSet<CollectionId>>,
}

impl AccessScope {
    pub fn new(collections: impl IntoIterator<Item = CollectionId>) -> Self {
        Self {
            collections: Some(collections.into_iter().collect()),
        }
    }

    /// Unrestricted scope for operators and local tools.
    pub fn any() -> Self {
        Self { collections: None }
    }

    pub fn allows(&self, collection: &CollectionId) -> bool {
        self.collections
            .as_ref()
            .is_none_or(|allowed| allowed.contains(collection))
    }

    fn check(&self, collection: &CollectionId) -> RagResult<()> {
        if self.allows(collection) {
            Ok(())
        } else {
            Err(RagError::NotFound(format!("collection '{collection}'")))
        }
    }
}

pub struct Pipeline {
    settings: Arc<Settings>,
    manager: CollectionManager,
    retriever: Retriever,
    registry_path: Option<PathBuf>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("manager", &self.manager)
            .field("retriever", &self.retriever)
            .field("registry_path", &self.registry_path)
            .finish()
    }
}

impl Pipeline {
    /// Build every component from configuration. Storage keys resolve
    /// against the current directory.
    pub async fn from_settings(settings: Arc<Settings>) -> RagResult<Self> {
        let provider = Arc::new(FsStorageProvider::new(std::env::current_dir()?));
        Self::with_provider(settings, provider).await
    }

    pub async fn with_provider(
        settings: Arc<Settings>,
        provider: Arc<dyn StorageProvider>,
    ) -> RagResult<Self> {
        settings.validate()?;
        let policy = RetryPolicy::from_config(&settings.retry);
        let embedder = build_embedder(&settings.embedding, policy).await?;
        let store = open_store(
            &settings.store,
            &settings.data_dir,
            settings.retrieval.lexical_weight,
        )
        .await?;
        let reranker =
            build_reranker(&settings.retrieval, settings.embedding.cache_dir.clone()).await?;
        Self::from_parts(settings, store, embedder, reranker, provider)
    }

    /// Assemble from already-built components.
    ///
    /// The document registry is persisted under `data_dir` unless the store
    /// itself is in-memory.
    pub fn from_parts(
        settings: Arc<Settings>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        provider: Arc<dyn StorageProvider>,
    ) -> RagResult<Self> {
        let registry_path = match settings.store.backend {
            StoreBackend::Memory => None,
            _ => Some(settings.data_dir.join(REGISTRY_FILE)),
        };
        let registry = match &registry_path {
            Some(path) => DocumentRegistry::load(path)?,
            None => DocumentRegistry::new(),
        };

        let policy = RetryPolicy::from_config(&settings.retry);
        let loaders = Arc::new(LoaderRegistry::with_defaults(settings.loader.clone()));
        let retriever = Retriever::new(
            settings.retrieval.clone(),
            store.clone(),
            embedder.clone(),
            reranker,
            policy,
        );
        let manager = CollectionManager::new(
            settings.clone(),
            Arc::new(registry),
            store,
            embedder,
            loaders,
            provider,
        )?;

        Ok(Self {
            settings,
            manager,
            retriever,
            registry_path,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manager(&self) -> &CollectionManager {
        &self.manager
    }

    pub async fn ingest(
        &self,
        scope: &AccessScope,
        collection: &CollectionId,
        request: DocumentRequest,
    ) -> RagResult<DocumentRecord> {
        scope.check(collection)?;
        let record = self.manager.ingest(collection, request).await;
        self.persist().await;
        record
    }

    /// Ingest several documents; one result per request, in order.
    pub async fn ingest_batch(
        &self,
        scope: &AccessScope,
        collection: &CollectionId,
        requests: Vec<DocumentRequest>,
    ) -> RagResult<Vec<RagResult<DocumentRecord>>> {
        scope.check(collection)?;
        let results = self.manager.ingest_batch(collection, requests).await;
        self.persist().await;
        Ok(results)
    }

    pub fn ingest_status(&self, scope: &AccessScope, id: &DocumentId) -> RagResult<DocumentRecord> {
        let record = self.manager.ingest_status(id)?;
        if !scope.allows(&record.collection) {
            return Err(RagError::NotFound(format!("document '{id}'")));
        }
        Ok(record)
    }

    pub fn list_documents(
        &self,
        scope: &AccessScope,
        collection: &CollectionId,
    ) -> RagResult<Vec<DocumentRecord>> {
        scope.check(collection)?;
        Ok(self.manager.list_documents(collection))
    }

    pub async fn delete_document(
        &self,
        scope: &AccessScope,
        collection: &CollectionId,
        id: &DocumentId,
    ) -> RagResult<usize> {
        scope.check(collection)?;
        let removed = self.manager.delete_document(collection, id).await;
        self.persist().await;
        removed
    }

    pub async fn delete_collection(
        &self,
        scope: &AccessScope,
        collection: &CollectionId,
    ) -> RagResult<Vec<DocumentId>> {
        scope.check(collection)?;
        let removed = self.manager.delete_collection(collection).await;
        self.persist().await;
        removed
    }

    pub async fn query(&self, scope: &AccessScope, request: &QueryRequest) -> RagResult<QueryResult> {
        for collection in &request.collections {
            scope.check(collection)?;
        }
        self.retriever.query(request).await
    }

    /// Save the registry off the async workers. Saves never overlap.
    async fn persist(&self) {
        let Some(path) = &self.registry_path else {
            return;
        };
        let registry = self.manager.registry().clone();
        let target = path.clone();
        let saved = tokio::task::spawn_blocking(move || registry.save(&target))
            .await
            .map_err(|e| RagError::corrupt(format!("registry save task failed: {e}")))
            .and_then(|result| result);
        if let Err(e) = saved {
            tracing::error!(
                target: "pipeline",
                "failed to save document registry to {}: {e}",
                path.display()
            );
        }
    }
}
