//! Core data model shared by ingestion and retrieval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ErrorKind, RagError};

/// Opaque identifier of a document, unique within the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Random v4 identifier for callers that do not supply one.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Name of a knowledge collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identity of a chunk: its document plus its position in that document.
///
/// Upserts are idempotent on this identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkIdentity {
    pub document_id: DocumentId,
    pub seq: u32,
}

impl ChunkIdentity {
    pub fn new(document_id: DocumentId, seq: u32) -> Self {
        Self { document_id, seq }
    }

    /// Stable string key used as a primary key by backends.
    pub fn key(&self) -> String {
        format!("{}:{}", self.document_id, self.seq)
    }
}

/// Byte range into a document's normalized text, always on char boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// A metadata value attached to chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// Well-known metadata keys stamped on every chunk.
pub mod meta_keys {
    pub const DOCUMENT_ID: &str = "document_id";
    pub const TITLE: &str = "title";
    pub const SOURCE: &str = "source";
    pub const MIME: &str = "mime";
    pub const PAGE: &str = "page";
    pub const SECTION: &str = "section";
    pub const INGESTED_AT: &str = "ingested_at";
}

/// Where the raw bytes of a document come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum SourceRef {
    /// Key resolved through the storage provider
    Key(String),
    /// Web page fetched over HTTP
    Url(String),
    /// Text pasted directly by the user
    Inline(String),
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key:{key}"),
            Self::Url(url) => f.write_str(url),
            Self::Inline(text) => write!(f, "inline:{}B", text.len()),
        }
    }
}

/// Ingestion request for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub id: DocumentId,
    pub source: SourceRef,
    /// Declared mime type; parameters such as `charset` are ignored
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// User-supplied tags copied onto every chunk
    #[serde(default)]
    pub tags: Metadata,
}

impl DocumentRequest {
    pub fn new(id: impl Into<DocumentId>, source: SourceRef, mime: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source,
            mime: mime.into(),
            title: None,
            tags: Metadata::new(),
        }
    }

    pub fn inline(id: impl Into<DocumentId>, text: impl Into<String>) -> Self {
        Self::new(id, SourceRef::Inline(text.into()), "text/plain")
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Ingestion lifecycle of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a document ended up `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&RagError> for FailureDetail {
    fn from(err: &RagError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A document as tracked by the collection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub collection: CollectionId,
    pub source: SourceRef,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Length in bytes of the normalized text
    pub text_len: usize,
    pub status: DocumentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureDetail>,
    pub chunk_count: usize,
    /// SHA-256 of the normalized text, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn pending(collection: CollectionId, request: &DocumentRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.id.clone(),
            collection,
            source: request.source.clone(),
            mime: request.mime.clone(),
            title: request.title.clone(),
            text_len: 0,
            status: DocumentStatus::Pending,
            error: None,
            chunk_count: 0,
            content_hash: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A span of normalized text prepared for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub identity: ChunkIdentity,
    pub span: TextSpan,
    pub text: String,
    pub metadata: Metadata,
    /// Present only after the embedding stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    /// Get a preview of the content (first N characters).
    pub fn preview(&self, max_chars: usize) -> &str {
        match self.text.char_indices().nth(max_chars) {
            Some((end, _)) => &self.text[..end],
            None => &self.text,
        }
    }
}

/// Citation data returned alongside each retrieved match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: DocumentId,
    pub seq: u32,
    pub span: TextSpan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl Citation {
    pub fn from_metadata(identity: &ChunkIdentity, span: TextSpan, metadata: &Metadata) -> Self {
        let text = |key: &str| metadata.get(key).and_then(MetaValue::as_str).map(str::to_string);
        Self {
            document_id: identity.document_id.clone(),
            seq: identity.seq,
            span,
            title: text(meta_keys::TITLE),
            source: text(meta_keys::SOURCE),
            page: metadata.get(meta_keys::PAGE).and_then(MetaValue::as_i64),
            section: text(meta_keys::SECTION),
        }
    }
}
