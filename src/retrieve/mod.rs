//! Query-time retrieval across one or more collections.
//!
//! Flow for one query:
//! 1. Embed the query text once
//! 2. Search every target collection concurrently, natively hybrid where the
//!    backend supports it, otherwise vector-only with a local lexical boost
//! 3. Merge with per-collection normalization ([`merge::merge_ranked`])
//! 4. Optionally rerank the top-N survivors
//! 5. Cap the merged list at `k`
//!
//! An unreachable collection degrades the result (`partial`) instead of
//! failing it, unless no collection could be searched at all.

pub mod lexical;
pub mod merge;
pub mod rerank;

pub use lexical::LexicalScorer;
pub use merge::{CollectionHits, merge_ranked};
pub use rerank::{CrossEncoderReranker, LexicalReranker, Reranker, build_reranker};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embed::Embedder;
use crate::error::{RagError, RagResult};
use crate::retry::{RetryPolicy, retry};
use crate::store::{Filter, ScoredChunk, VectorStore, rank_order};
use crate::types::{ChunkIdentity, Citation, CollectionId, FailureDetail, Metadata, TextSpan};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub collections: Vec<CollectionId>,
    pub text: String,
    /// Falls back to `retrieval.top_k`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

impl QueryRequest {
    pub fn new(collections: Vec<CollectionId>, text: impl Into<String>) -> Self {
        Self {
            collections,
            text: text.into(),
            k: None,
            filter: None,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// One ranked chunk with its citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedMatch {
    pub collection: CollectionId,
    pub identity: ChunkIdentity,
    pub span: TextSpan,
    pub text: String,
    pub metadata: Metadata,
    /// Score normalized within its collection's result list
    pub score: f32,
    /// Score as reported by the backend
    pub raw_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    pub citation: Citation,
}

impl RetrievedMatch {
    pub fn from_hit(collection: &CollectionId, hit: &ScoredChunk, score: f32) -> Self {
        Self {
            collection: collection.clone(),
            identity: hit.identity.clone(),
            span: hit.span,
            text: hit.text.clone(),
            metadata: hit.metadata.clone(),
            score,
            raw_score: hit.score,
            rerank_score: None,
            citation: Citation::from_metadata(&hit.identity, hit.span, &hit.metadata),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionFailure {
    pub collection: CollectionId,
    pub error: FailureDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub matches: Vec<RetrievedMatch>,
    /// Some targeted collections could not be searched
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_collections: Vec<CollectionFailure>,
}

pub struct Retriever {
    config: RetrievalConfig,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("config", &self.config)
            .field("store", &self.store.name())
            .field("reranker", &self.reranker.as_ref().map(|r| r.name().to_string()))
            .finish()
    }
}

impl Retriever {
    pub fn new(
        config: RetrievalConfig,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            reranker,
            policy,
        }
    }

    pub async fn query(&self, request: &QueryRequest) -> RagResult<QueryResult> {
        let mut collections = request.collections.clone();
        collections.sort();
        collections.dedup();
        if collections.is_empty() {
            return Err(RagError::InvalidConfig(
                "query must target at least one collection".to_string(),
            ));
        }

        let k = request.k.unwrap_or(self.config.top_k);
        if k == 0 {
            return Ok(QueryResult::default());
        }

        let vector = self.embedder.embed_query(&request.text).await?;
        let candidates = self.candidate_count(k);

        let searches = collections.iter().map(|collection| {
            self.search(
                collection,
                &vector,
                &request.text,
                candidates,
                request.filter.as_ref(),
            )
        });
        let outcomes = futures_util::future::join_all(searches).await;

        let mut lists = Vec::new();
        let mut failed = Vec::new();
        for (collection, outcome) in collections.iter().zip(outcomes) {
            match outcome {
                Ok(hits) => lists.push(CollectionHits::new(collection.clone(), hits)),
                // Nothing ingested yet
                Err(RagError::NotFound(_)) => {
                    lists.push(CollectionHits::new(collection.clone(), Vec::new()));
                }
                Err(err) => {
                    tracing::warn!(target: "retrieve", "search of '{collection}' failed: {err}");
                    failed.push(CollectionFailure {
                        collection: collection.clone(),
                        error: FailureDetail::from(&err),
                    });
                }
            }
        }

        if lists.is_empty() {
            let reasons: Vec<String> = failed
                .iter()
                .map(|f| format!("{}: {}", f.collection, f.error.message))
                .collect();
            return Err(RagError::RetrievalUnavailable(reasons.join("; ")));
        }

        let mut matches = merge_ranked(&lists, self.config.relevance_cutoff);
        if let Some(reranker) = &self.reranker {
            self.rerank(reranker.as_ref(), &request.text, &mut matches)
                .await;
        }
        matches.truncate(k);

        tracing::debug!(
            target: "retrieve",
            "query over {} collections returned {} matches ({} failed)",
            collections.len(),
            matches.len(),
            failed.len()
        );

        Ok(QueryResult {
            matches,
            partial: !failed.is_empty(),
            failed_collections: failed,
        })
    }

    /// Candidates requested per collection: enough for the reranker head.
    fn candidate_count(&self, k: usize) -> usize {
        if self.reranker.is_some() {
            k.max(self.config.rerank_top_n)
        } else {
            k
        }
    }

    async fn search(
        &self,
        collection: &CollectionId,
        vector: &[f32],
        text: &str,
        k: usize,
        filter: Option<&Filter>,
    ) -> RagResult<Vec<ScoredChunk>> {
        let capabilities = self.store.capabilities();
        let filter = filter.filter(|f| !f.is_empty());
        // Backends without metadata filters rank everything, then filter here
        let local_filter = filter.filter(|f| f.has_metadata() && !capabilities.metadata_filters);
        let backend_filter = match local_filter {
            Some(f) => Some(f.documents_only()).filter(|f| !f.is_empty()),
            None => filter.cloned(),
        };
        let hybrid = self.config.hybrid_enabled && !text.trim().is_empty();

        let mut fetch = k;
        if local_filter.is_some() {
            fetch = retry(&self.policy, "count", || self.store.count(collection)).await?;
        }

        if hybrid && capabilities.hybrid {
            let native = retry(&self.policy, "hybrid query", || {
                self.store
                    .hybrid_query(collection, vector, text, fetch, backend_filter.as_ref())
            })
            .await;
            match native {
                Ok(mut hits) => {
                    if let Some(f) = local_filter {
                        hits.retain(|h| f.matches(&h.identity, &h.metadata));
                    }
                    hits.truncate(k);
                    return Ok(hits);
                }
                Err(RagError::CapabilityUnsupported { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        if hybrid && local_filter.is_none() {
            fetch = k.saturating_mul(self.config.candidate_multiplier.max(1));
        }
        let mut hits = retry(&self.policy, "query", || {
            self.store
                .query(collection, vector, fetch, backend_filter.as_ref())
        })
        .await?;

        if let Some(f) = local_filter {
            hits.retain(|h| f.matches(&h.identity, &h.metadata));
        }
        if hybrid {
            let scorer = LexicalScorer::new(text);
            for hit in &mut hits {
                let boost = scorer.score(&hit.text);
                hit.score = lexical::blend(hit.score, boost, self.config.lexical_weight);
            }
            hits.sort_by(rank_order);
        }
        hits.truncate(k);
        Ok(hits)
    }

    /// Rerank the head in place. Failures keep the merged order.
    async fn rerank(&self, reranker: &dyn Reranker, query: &str, matches: &mut [RetrievedMatch]) {
        let head = self.config.rerank_top_n.min(matches.len());
        if head == 0 {
            return;
        }
        match reranker.rerank(query, &matches[..head]).await {
            Ok(scores) if scores.len() == head => rerank::apply_scores(matches, head, &scores),
            Ok(scores) => tracing::warn!(
                target: "retrieve",
                "{} returned {} scores for {head} matches; keeping merged order",
                reranker.name(),
                scores.len()
            ),
            Err(err) => tracing::warn!(
                target: "retrieve",
                "{} failed, keeping merged order: {err}",
                reranker.name()
            ),
        }
    }
}
