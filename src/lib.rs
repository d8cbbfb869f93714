pub mod chunker;
pub mod cli;
pub mod collection;
pub mod config;
pub mod embed;
pub mod error;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod retrieve;
pub mod retry;
pub mod storage_provider;
pub mod store;
pub mod types;

pub use chunker::{ChunkCursor, ChunkSpan, Chunker};
pub use collection::{CollectionManager, DocumentRegistry};
pub use config::Settings;
pub use embed::{BatchingEmbedder, Embedder, HashingEmbedder};
pub use error::{ErrorKind, RagError, RagResult};
pub use loader::{LoadedDocument, LoaderRegistry, StructuralMap};
pub use pipeline::{AccessScope, Pipeline};
pub use retrieve::{QueryRequest, QueryResult, RetrievedMatch, Retriever};
pub use storage_provider::{FsStorageProvider, MemoryStorageProvider, StorageProvider};
pub use store::{Capabilities, Filter, VectorStore};
pub use types::{
    Chunk, ChunkIdentity, Citation, CollectionId, DocumentId, DocumentRecord, DocumentRequest,
    DocumentStatus, SourceRef,
};
