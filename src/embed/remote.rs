use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::{RagError, RagResult};

/// OpenAI-compatible `/embeddings` endpoint (Ollama, LM Studio, vLLM, ...).
pub struct RemoteEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    max_batch_size: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::InvalidConfig(format!("http client: {e}")))?;
        let api_key = std::env::var(&config.remote.api_key_env)
            .ok()
            .filter(|key| !key.is_empty());

        Ok(Self {
            client,
            url: format!("{}/embeddings", config.remote.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            dimension: config.dimension,
            max_batch_size: config.max_batch_size.max(1),
        })
    }
}

/// Connection problems, 429 and 5xx are worth retrying; other 4xx are not.
fn classify_status(status: reqwest::StatusCode, body: &str) -> RagError {
    let message = format!("embedding endpoint returned {status}: {}", body.trim());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        RagError::EmbeddingUnavailable(message)
    } else {
        RagError::EmbeddingRejected(message)
    }
}

/// Order vectors by their `index` field when the server provides one.
fn into_ordered(response: EmbeddingResponse) -> Vec<Vec<f32>> {
    let mut items = response.data;
    if items.iter().all(|item| item.index.is_some()) {
        items.sort_by_key(|item| item.index);
    }
    items.into_iter().map(|item| item.embedding).collect()
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let body = json!({
            "model": self.model,
            "input": texts,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RagError::EmbeddingUnavailable(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::EmbeddingUnavailable(format!("malformed response: {e}")))?;
        Ok(into_ordered(payload))
    }
}
