//! Qdrant over its REST API.
//!
//! Upserts are not atomic across points and deletes are issued without
//! waiting, so removal is only eventually visible. The collection manager
//! polls `document_exists` after deleting.

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::{
    Capabilities, CollectionInfo, Filter, Metric, ScoredChunk, StoredChunk, VectorStore,
    check_dimensions, missing,
};
use crate::error::{RagError, RagResult};
use crate::types::{ChunkIdentity, CollectionId, DocumentId, MetaValue, Metadata, TextSpan};

const SCROLL_PAGE: usize = 256;

pub struct QdrantStore {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct Hit {
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ScrollPage {
    points: Vec<ScrollPoint>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ScrollPoint {
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}

/// Stable numeric point id for a chunk identity.
fn point_id(identity: &ChunkIdentity) -> u64 {
    let digest = Sha256::digest(identity.key().as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

fn match_condition(key: &str, value: &MetaValue) -> Value {
    match value {
        MetaValue::Float(f) => json!({ "key": key, "range": { "gte": f, "lte": f } }),
        MetaValue::Bool(b) => json!({ "key": key, "match": { "value": b } }),
        MetaValue::Int(i) => json!({ "key": key, "match": { "value": i } }),
        MetaValue::Text(s) => json!({ "key": key, "match": { "value": s } }),
    }
}

/// Translate a filter into Qdrant's `must` clause list.
fn filter_json(filter: &Filter) -> Value {
    let mut must = Vec::new();
    if !filter.document_ids.is_empty() {
        let ids: Vec<&str> = filter.document_ids.iter().map(DocumentId::as_str).collect();
        must.push(json!({ "key": "document_id", "match": { "any": ids } }));
    }
    for (key, value) in &filter.equals {
        must.push(match_condition(&format!("metadata.{key}"), value));
    }
    json!({ "must": must })
}

fn payload_json(chunk: &StoredChunk) -> Value {
    json!({
        "document_id": chunk.identity.document_id.as_str(),
        "seq": chunk.identity.seq,
        "span_start": chunk.span.start,
        "span_end": chunk.span.end,
        "text": chunk.text,
        "metadata": chunk.metadata,
    })
}

fn identity_from_payload(payload: &Value) -> Option<ChunkIdentity> {
    let document_id = payload.get("document_id")?.as_str()?;
    let seq = payload.get("seq")?.as_u64()?;
    Some(ChunkIdentity::new(DocumentId::new(document_id), seq as u32))
}

fn scored_from_payload(payload: &Value, score: f32) -> Option<ScoredChunk> {
    let number = |key: &str| payload.get(key).and_then(Value::as_u64).unwrap_or(0) as usize;
    let metadata: Metadata = payload
        .get("metadata")
        .cloned()
        .and_then(|m| serde_json::from_value(m).ok())
        .unwrap_or_default();
    Some(ScoredChunk {
        identity: identity_from_payload(payload)?,
        span: TextSpan::new(number("span_start"), number("span_end")),
        text: payload.get("text")?.as_str()?.to_string(),
        metadata,
        score,
    })
}

impl QdrantStore {
    pub fn new(url: &str, api_key: Option<String>) -> RagResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RagError::InvalidConfig(format!("http client: {e}")))?;
        let base_url = Url::parse(url)
            .ok()
            .filter(|u| !u.cannot_be_a_base())
            .ok_or_else(|| RagError::InvalidConfig(format!("qdrant url '{url}' is not a base url")))?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    /// Collection endpoint; the collection name is percent-encoded as one
    /// path segment.
    fn url(&self, collection: &CollectionId, path: &str) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["collections", collection.as_str()]);
        }
        format!("{url}{path}")
    }

    /// Send a request; `Ok(None)` on 404.
    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> RagResult<Option<Value>> {
        let mut request = self.http.request(method, &url);
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RagError::BackendUnavailable(format!("qdrant {url}: {e}")))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = format!("{status}: {}", text.trim());
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                RagError::BackendUnavailable(format!("qdrant {reason}"))
            } else {
                RagError::Storage {
                    backend: "qdrant",
                    reason,
                }
            });
        }
        let value = response
            .json::<Value>()
            .await
            .map_err(|e| RagError::BackendUnavailable(format!("qdrant response: {e}")))?;
        Ok(Some(value))
    }

    async fn send_required(
        &self,
        collection: &CollectionId,
        method: Method,
        url: String,
        body: Value,
    ) -> RagResult<Value> {
        self.send(method, url, Some(body))
            .await?
            .ok_or_else(|| missing(collection))
    }

    async fn count_matching(
        &self,
        collection: &CollectionId,
        filter: Option<&Filter>,
    ) -> RagResult<usize> {
        let mut body = json!({ "exact": true });
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            body["filter"] = filter_json(filter);
        }
        let url = self.url(collection, "/points/count");
        let value = self
            .send_required(collection, Method::POST, url, body)
            .await?;
        let envelope: Envelope<CountResult> = serde_json::from_value(value)?;
        Ok(envelope.result.count)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn name(&self) -> &'static str {
        "qdrant"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            hybrid: false,
            metadata_filters: true,
            atomic_upsert: false,
            synchronous_delete: false,
            metric: Metric::Cosine,
        }
    }

    async fn ensure_collection(
        &self,
        collection: &CollectionId,
        dimension: usize,
    ) -> RagResult<CollectionInfo> {
        if let Some(existing) = self.collection_info(collection).await? {
            if existing.dimension != dimension {
                return Err(RagError::DimensionalityConflict {
                    collection: collection.to_string(),
                    expected: existing.dimension,
                    actual: dimension,
                });
            }
            return Ok(existing);
        }

        let body = json!({ "vectors": { "size": dimension, "distance": "Cosine" } });
        match self.send(Method::PUT, self.url(collection, ""), Some(body)).await {
            Ok(_) => {}
            // Lost a creation race: fall through to the dimension check
            Err(RagError::Storage { reason, .. }) if reason.starts_with("409") => {}
            Err(e) => return Err(e),
        }
        match self.collection_info(collection).await? {
            Some(info) if info.dimension == dimension => Ok(info),
            Some(info) => Err(RagError::DimensionalityConflict {
                collection: collection.to_string(),
                expected: info.dimension,
                actual: dimension,
            }),
            None => Err(missing(collection)),
        }
    }

    async fn collection_info(
        &self,
        collection: &CollectionId,
    ) -> RagResult<Option<CollectionInfo>> {
        let Some(value) = self.send(Method::GET, self.url(collection, ""), None).await? else {
            return Ok(None);
        };
        let dimension = value
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .ok_or_else(|| RagError::Storage {
                backend: "qdrant",
                reason: format!("collection '{collection}' has no single unnamed vector"),
            })?;
        Ok(Some(CollectionInfo {
            collection: collection.clone(),
            dimension: dimension as usize,
        }))
    }

    async fn drop_collection(&self, collection: &CollectionId) -> RagResult<()> {
        self.send(Method::DELETE, self.url(collection, ""), None)
            .await?;
        Ok(())
    }

    async fn upsert(&self, collection: &CollectionId, chunks: &[StoredChunk]) -> RagResult<()> {
        let info = self
            .collection_info(collection)
            .await?
            .ok_or_else(|| missing(collection))?;
        check_dimensions(
            collection,
            info.dimension,
            chunks.iter().map(|c| c.vector.as_slice()),
        )?;
        if chunks.is_empty() {
            return Ok(());
        }

        let points: Vec<Value> = chunks
            .iter()
            .map(|chunk| {
                json!({
                    "id": point_id(&chunk.identity),
                    "vector": chunk.vector,
                    "payload": payload_json(chunk),
                })
            })
            .collect();
        let url = self.url(collection, "/points?wait=true");
        self.send_required(collection, Method::PUT, url, json!({ "points": points }))
            .await?;
        Ok(())
    }

    async fn delete(&self, collection: &CollectionId, filter: &Filter) -> RagResult<usize> {
        if self.collection_info(collection).await?.is_none() {
            return Ok(0);
        }
        let matching = self.count_matching(collection, Some(filter)).await?;
        if matching == 0 {
            return Ok(0);
        }
        let url = self.url(collection, "/points/delete?wait=false");
        self.send_required(
            collection,
            Method::POST,
            url,
            json!({ "filter": filter_json(filter) }),
        )
        .await?;
        Ok(matching)
    }

    async fn list_identities(
        &self,
        collection: &CollectionId,
        filter: &Filter,
    ) -> RagResult<Vec<ChunkIdentity>> {
        let mut identities = Vec::new();
        let mut offset: Option<Value> = None;
        loop {
            let mut body = json!({
                "limit": SCROLL_PAGE,
                "with_payload": ["document_id", "seq"],
                "with_vector": false,
            });
            if !filter.is_empty() {
                body["filter"] = filter_json(filter);
            }
            if let Some(offset) = offset.take() {
                body["offset"] = offset;
            }

            let url = self.url(collection, "/points/scroll");
            let Some(value) = self.send(Method::POST, url, Some(body)).await? else {
                return Ok(Vec::new());
            };
            let page: Envelope<ScrollPage> = serde_json::from_value(value)?;
            identities.extend(
                page.result
                    .points
                    .iter()
                    .filter_map(|p| p.payload.as_ref().and_then(identity_from_payload)),
            );
            match page.result.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }
        identities.sort();
        Ok(identities)
    }

    async fn count(&self, collection: &CollectionId) -> RagResult<usize> {
        match self.count_matching(collection, None).await {
            Err(RagError::NotFound(_)) => Ok(0),
            other => other,
        }
    }

    async fn query(
        &self,
        collection: &CollectionId,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> RagResult<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            body["filter"] = filter_json(filter);
        }

        let url = self.url(collection, "/points/search");
        let value = match self.send_required(collection, Method::POST, url, body).await {
            // Qdrant reports a wrong vector size as a 400
            Err(RagError::Storage { reason, .. }) if reason.contains("dimension") => {
                let expected = self
                    .collection_info(collection)
                    .await?
                    .map_or(0, |info| info.dimension);
                return Err(RagError::DimensionalityConflict {
                    collection: collection.to_string(),
                    expected,
                    actual: vector.len(),
                });
            }
            other => other?,
        };
        let envelope: Envelope<Vec<Hit>> = serde_json::from_value(value)?;
        let mut hits: Vec<ScoredChunk> = envelope
            .result
            .iter()
            .filter_map(|hit| {
                hit.payload
                    .as_ref()
                    .and_then(|p| scored_from_payload(p, hit.score))
            })
            .collect();
        hits.sort_by(super::rank_order);
        Ok(hits)
    }
}
