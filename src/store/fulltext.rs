//! Tantivy-backed vector store with native hybrid search.
//!
//! One on-disk index per collection under `<root>/<collection>/`. Chunk text is
//! indexed for BM25; vectors are stored alongside and scored by brute-force
//! cosine over the filtered candidate set. Metadata equality filters are
//! indexed as `key=<json value>` terms.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tantivy::collector::{Count, DocSetCollector, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    FAST, Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, SchemaBuilder,
    TextFieldIndexing, TextOptions, Value,
};
use tantivy::{
    DocAddress, Index, IndexReader, IndexSettings, IndexWriter, ReloadPolicy,
    TantivyDocument as Document, Term,
};

use super::{
    Capabilities, CollectionInfo, Filter, Metric, ScoredChunk, StoredChunk, VectorStore,
    check_dimensions, cosine_similarity, missing, top_k, vector_from_bytes, vector_to_bytes,
};
use crate::error::{RagError, RagResult};
use crate::types::{ChunkIdentity, CollectionId, DocumentId, MetaValue, Metadata, TextSpan};

const WRITER_HEAP_BYTES: usize = 50_000_000;
const COLLECTION_FILE: &str = "collection.json";

/// Schema fields for chunk documents.
#[derive(Debug, Clone, Copy)]
struct ChunkFields {
    /// `"{document_id}:{seq}"`, the upsert key
    key: Field,
    document_id: Field,
    seq: Field,
    span_start: Field,
    span_end: Field,
    /// Chunk text, tokenized for BM25
    content: Field,
    /// `key=<json value>` per metadata entry, for exact filtering
    meta_terms: Field,
    metadata_json: Field,
    /// Little-endian f32 bytes
    vector: Field,
}

impl ChunkFields {
    fn build() -> (Schema, Self) {
        let mut builder = SchemaBuilder::default();

        let key = builder.add_text_field("key", STRING | STORED);
        let document_id = builder.add_text_field("document_id", STRING | STORED | FAST);
        let seq = builder.add_u64_field("seq", INDEXED | STORED | FAST);
        let span_start = builder.add_u64_field("span_start", STORED);
        let span_end = builder.add_u64_field("span_end", STORED);

        let text_options = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer("default")
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored();
        let content = builder.add_text_field("content", text_options);

        let meta_terms = builder.add_text_field("meta_terms", STRING);
        let metadata_json = builder.add_text_field("metadata_json", STORED);
        let vector = builder.add_bytes_field("vector", STORED);

        let fields = Self {
            key,
            document_id,
            seq,
            span_start,
            span_end,
            content,
            meta_terms,
            metadata_json,
            vector,
        };
        (builder.build(), fields)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CollectionFile {
    dimension: usize,
}

struct IndexedCollection {
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter<Document>>>,
    dimension: usize,
}

impl IndexedCollection {
    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut IndexWriter<Document>) -> RagResult<T>,
    ) -> RagResult<T> {
        let mut guard = self.writer.lock();
        if guard.is_none() {
            *guard = Some(self.index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?);
        }
        match guard.as_mut() {
            Some(writer) => f(writer),
            None => Err(RagError::Storage {
                backend: "tantivy",
                reason: "index writer unavailable".to_string(),
            }),
        }
    }
}

pub struct TantivyStore {
    root: PathBuf,
    schema: Schema,
    fields: ChunkFields,
    lexical_weight: f32,
    collections: DashMap<CollectionId, Arc<IndexedCollection>>,
}

impl std::fmt::Debug for TantivyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TantivyStore")
            .field("root", &self.root)
            .field("collections", &self.collections.len())
            .finish()
    }
}

/// Collection names are used as directory names when they are plain,
/// otherwise hex-encoded.
fn dir_name(collection: &CollectionId) -> String {
    let name = collection.as_str();
    let plain = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if plain {
        name.to_string()
    } else {
        format!("x-{}", hex::encode(name))
    }
}

fn meta_term(key: &str, value: &MetaValue) -> RagResult<String> {
    Ok(format!("{key}={}", serde_json::to_string(value)?))
}

impl TantivyStore {
    /// `lexical_weight` is the BM25 share of the hybrid score.
    pub fn open(root: impl AsRef<Path>, lexical_weight: f32) -> RagResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let (schema, fields) = ChunkFields::build();
        Ok(Self {
            root,
            schema,
            fields,
            lexical_weight: lexical_weight.clamp(0.0, 1.0),
            collections: DashMap::new(),
        })
    }

    fn collection_dir(&self, collection: &CollectionId) -> PathBuf {
        self.root.join(dir_name(collection))
    }

    fn open_collection(&self, dir: &Path, dimension: usize) -> RagResult<IndexedCollection> {
        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)?
        } else {
            let directory = MmapDirectory::open(dir)?;
            Index::create(directory, self.schema.clone(), IndexSettings::default())?
        };
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        reader.reload()?;
        Ok(IndexedCollection {
            index,
            reader,
            writer: Mutex::new(None),
            dimension,
        })
    }

    /// Open an existing collection, from memory or disk.
    fn get(&self, collection: &CollectionId) -> RagResult<Option<Arc<IndexedCollection>>> {
        if let Some(open) = self.collections.get(collection) {
            return Ok(Some(open.clone()));
        }
        let dir = self.collection_dir(collection);
        let file = dir.join(COLLECTION_FILE);
        if !file.exists() {
            return Ok(None);
        }
        let stored: CollectionFile = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
        let opened = Arc::new(self.open_collection(&dir, stored.dimension)?);
        let entry = self
            .collections
            .entry(collection.clone())
            .or_insert(opened)
            .clone();
        Ok(Some(entry))
    }

    fn require(&self, collection: &CollectionId) -> RagResult<Arc<IndexedCollection>> {
        self.get(collection)?.ok_or_else(|| missing(collection))
    }

    fn filter_query(&self, filter: Option<&Filter>) -> RagResult<Box<dyn Query>> {
        let Some(filter) = filter.filter(|f| !f.is_empty()) else {
            return Ok(Box::new(AllQuery));
        };

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        if !filter.document_ids.is_empty() {
            let any_document: Vec<(Occur, Box<dyn Query>)> = filter
                .document_ids
                .iter()
                .map(|id| {
                    let term = Term::from_field_text(self.fields.document_id, id.as_str());
                    (
                        Occur::Should,
                        Box::new(TermQuery::new(term, IndexRecordOption::Basic)) as Box<dyn Query>,
                    )
                })
                .collect();
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(any_document))));
        }
        for (key, value) in &filter.equals {
            let term = Term::from_field_text(self.fields.meta_terms, &meta_term(key, value)?);
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
            ));
        }
        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn to_document(&self, chunk: &StoredChunk) -> RagResult<Document> {
        let mut doc = Document::new();
        doc.add_text(self.fields.key, chunk.identity.key());
        doc.add_text(self.fields.document_id, chunk.identity.document_id.as_str());
        doc.add_u64(self.fields.seq, u64::from(chunk.identity.seq));
        doc.add_u64(self.fields.span_start, chunk.span.start as u64);
        doc.add_u64(self.fields.span_end, chunk.span.end as u64);
        doc.add_text(self.fields.content, &chunk.text);
        for (key, value) in &chunk.metadata {
            doc.add_text(self.fields.meta_terms, meta_term(key, value)?);
        }
        doc.add_text(self.fields.metadata_json, serde_json::to_string(&chunk.metadata)?);
        doc.add_bytes(self.fields.vector, &vector_to_bytes(&chunk.vector));
        Ok(doc)
    }

    /// Decode a stored document into the chunk and its vector.
    fn decode_document(&self, doc: &Document) -> RagResult<(ScoredChunk, Vec<f32>)> {
        let text = |field: Field| doc.get_first(field).and_then(|v| v.as_str()).unwrap_or("");
        let number = |field: Field| doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0);

        let metadata: Metadata = serde_json::from_str(text(self.fields.metadata_json))?;
        let vector = match doc.get_first(self.fields.vector).and_then(|v| v.as_bytes()) {
            Some(raw) if raw.len() % 4 == 0 => vector_from_bytes(raw),
            _ => {
                return Err(RagError::Storage {
                    backend: "tantivy",
                    reason: format!("chunk '{}' has no readable vector", text(self.fields.key)),
                });
            }
        };
        let chunk = ScoredChunk {
            identity: ChunkIdentity::new(
                DocumentId::new(text(self.fields.document_id)),
                number(self.fields.seq) as u32,
            ),
            span: TextSpan::new(
                number(self.fields.span_start) as usize,
                number(self.fields.span_end) as usize,
            ),
            text: text(self.fields.content).to_string(),
            metadata,
            score: 0.0,
        };
        Ok((chunk, vector))
    }

    /// Every chunk passing `filter`, scored by cosine against `vector`.
    fn vector_scores(
        &self,
        collection: &IndexedCollection,
        vector: &[f32],
        filter: Option<&Filter>,
    ) -> RagResult<HashMap<DocAddress, ScoredChunk>> {
        let searcher = collection.reader.searcher();
        let addresses = searcher.search(&*self.filter_query(filter)?, &DocSetCollector)?;
        let mut scored = HashMap::with_capacity(addresses.len());
        for address in addresses {
            let doc: Document = searcher.doc(address)?;
            let (mut chunk, stored) = self.decode_document(&doc)?;
            chunk.score = cosine_similarity(vector, &stored);
            scored.insert(address, chunk);
        }
        Ok(scored)
    }

    fn commit(collection: &IndexedCollection, writer: &mut IndexWriter<Document>) -> RagResult<()> {
        writer.commit()?;
        collection.reader.reload()?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for TantivyStore {
    fn name(&self) -> &'static str {
        "tantivy"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            hybrid: true,
            metadata_filters: true,
            atomic_upsert: true,
            synchronous_delete: true,
            metric: Metric::Cosine,
        }
    }

    async fn ensure_collection(
        &self,
        collection: &CollectionId,
        dimension: usize,
    ) -> RagResult<CollectionInfo> {
        if let Some(existing) = self.get(collection)? {
            if existing.dimension != dimension {
                return Err(RagError::DimensionalityConflict {
                    collection: collection.to_string(),
                    expected: existing.dimension,
                    actual: dimension,
                });
            }
            return Ok(CollectionInfo {
                collection: collection.clone(),
                dimension,
            });
        }

        let dir = self.collection_dir(collection);
        std::fs::create_dir_all(&dir)?;
        let opened = Arc::new(self.open_collection(&dir, dimension)?);
        std::fs::write(
            dir.join(COLLECTION_FILE),
            serde_json::to_string(&CollectionFile { dimension })?,
        )?;
        self.collections.insert(collection.clone(), opened);
        tracing::debug!(target: "store", "created tantivy collection '{collection}' ({dimension}d)");

        Ok(CollectionInfo {
            collection: collection.clone(),
            dimension,
        })
    }

    async fn collection_info(
        &self,
        collection: &CollectionId,
    ) -> RagResult<Option<CollectionInfo>> {
        Ok(self.get(collection)?.map(|c| CollectionInfo {
            collection: collection.clone(),
            dimension: c.dimension,
        }))
    }

    async fn drop_collection(&self, collection: &CollectionId) -> RagResult<()> {
        if let Some((_, open)) = self.collections.remove(collection) {
            // Release the writer lock before removing files
            open.writer.lock().take();
        }
        let dir = self.collection_dir(collection);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    async fn upsert(&self, collection: &CollectionId, chunks: &[StoredChunk]) -> RagResult<()> {
        let indexed = self.require(collection)?;
        check_dimensions(
            collection,
            indexed.dimension,
            chunks.iter().map(|c| c.vector.as_slice()),
        )?;
        let documents = chunks
            .iter()
            .map(|c| self.to_document(c))
            .collect::<RagResult<Vec<_>>>()?;

        indexed.with_writer(|writer| {
            for (chunk, doc) in chunks.iter().zip(documents) {
                writer.delete_term(Term::from_field_text(self.fields.key, &chunk.identity.key()));
                if let Err(e) = writer.add_document(doc) {
                    writer.rollback()?;
                    return Err(e.into());
                }
            }
            Self::commit(&indexed, writer)
        })
    }

    async fn delete(&self, collection: &CollectionId, filter: &Filter) -> RagResult<usize> {
        let Some(indexed) = self.get(collection)? else {
            return Ok(0);
        };
        let query = self.filter_query(Some(filter))?;
        let matching = indexed.reader.searcher().search(&*query, &Count)?;
        if matching == 0 {
            return Ok(0);
        }
        indexed.with_writer(|writer| {
            writer.delete_query(query)?;
            Self::commit(&indexed, writer)
        })?;
        Ok(matching)
    }

    async fn list_identities(
        &self,
        collection: &CollectionId,
        filter: &Filter,
    ) -> RagResult<Vec<ChunkIdentity>> {
        let Some(indexed) = self.get(collection)? else {
            return Ok(Vec::new());
        };
        let searcher = indexed.reader.searcher();
        let addresses = searcher.search(&*self.filter_query(Some(filter))?, &DocSetCollector)?;
        let mut identities = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: Document = searcher.doc(address)?;
            let document_id = doc
                .get_first(self.fields.document_id)
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let seq = doc
                .get_first(self.fields.seq)
                .and_then(|v| v.as_u64())
                .unwrap_or_default();
            identities.push(ChunkIdentity::new(DocumentId::new(document_id), seq as u32));
        }
        identities.sort();
        Ok(identities)
    }

    async fn count(&self, collection: &CollectionId) -> RagResult<usize> {
        match self.get(collection)? {
            Some(indexed) => Ok(indexed.reader.searcher().num_docs() as usize),
            None => Ok(0),
        }
    }

    async fn query(
        &self,
        collection: &CollectionId,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> RagResult<Vec<ScoredChunk>> {
        let indexed = self.require(collection)?;
        check_dimensions(collection, indexed.dimension, [vector])?;
        let scored = self.vector_scores(&indexed, vector, filter)?;
        Ok(top_k(scored.into_values().collect(), k))
    }

    async fn hybrid_query(
        &self,
        collection: &CollectionId,
        vector: &[f32],
        text: &str,
        k: usize,
        filter: Option<&Filter>,
    ) -> RagResult<Vec<ScoredChunk>> {
        let indexed = self.require(collection)?;
        check_dimensions(collection, indexed.dimension, [vector])?;
        let mut scored = self.vector_scores(&indexed, vector, filter)?;
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        let parser = QueryParser::for_index(&indexed.index, vec![self.fields.content]);
        let (text_query, errors) = parser.parse_query_lenient(text);
        if !errors.is_empty() {
            tracing::debug!(target: "store", "lenient parse of '{text}' dropped {} clauses", errors.len());
        }
        let combined = BooleanQuery::new(vec![
            (Occur::Must, self.filter_query(filter)?),
            (Occur::Must, text_query),
        ]);
        let searcher = indexed.reader.searcher();
        let lexical = searcher.search(&combined, &TopDocs::with_limit(scored.len()))?;
        let max_bm25 = lexical.iter().map(|(s, _)| *s).fold(0.0f32, f32::max);

        let weight = self.lexical_weight;
        for chunk in scored.values_mut() {
            chunk.score *= 1.0 - weight;
        }
        if max_bm25 > 0.0 {
            for (bm25, address) in lexical {
                if let Some(chunk) = scored.get_mut(&address) {
                    chunk.score += weight * bm25 / max_bm25;
                }
            }
        }
        Ok(top_k(scored.into_values().collect(), k))
    }
}
