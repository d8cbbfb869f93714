//! Configuration for a pipeline instance.
//!
//! Settings are layered once at startup and then frozen:
//! - Default values
//! - TOML configuration file (`.groundwork/settings.toml`)
//! - Environment variable overrides
//!
//! The resulting [`Settings`] is wrapped in an `Arc` and handed to each
//! component constructor. Nothing inside the library reads configuration
//! from ambient state after that point.
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `GW_` and use double underscores
//! to separate nested levels:
//! - `GW_CHUNKING__WINDOW_SIZE=800` sets `chunking.window_size`
//! - `GW_STORE__BACKEND=sqlite` sets `store.backend`
//! - `GW_RETRIEVAL__HYBRID_ENABLED=false` sets `retrieval.hybrid_enabled`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RagError, RagResult};

const CONFIG_DIR: &str = ".groundwork";
const CONFIG_FILE: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding on-disk backends and the document registry
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How window and overlap sizes are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    /// A token is a run of non-whitespace plus its trailing whitespace
    #[default]
    Whitespace,
    /// A token is one Unicode scalar value
    Codepoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum tokens per chunk
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Tokens shared between consecutive chunks
    #[serde(default = "default_overlap")]
    pub overlap: usize,

    #[serde(default)]
    pub tokenizer: TokenizerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Raw size ceiling; larger inputs fail with `TooLarge`
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Read buffer used while streaming source bytes
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Deterministic feature hashing, no model download
    #[default]
    Hashing,
    /// Local ONNX model through fastembed
    Fastembed,
    /// OpenAI-compatible HTTP endpoint
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,

    /// Model identifier (fastembed model name or remote model id)
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Declared output dimensionality
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Largest batch sent to the backend in one call
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Inputs longer than this are rejected rather than truncated
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    /// Number of model instances kept for concurrent local embedding
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Model cache directory for fastembed downloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub remote: RemoteEmbeddingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEmbeddingConfig {
    /// Base URL; `/embeddings` is appended
    #[serde(default = "default_remote_endpoint")]
    pub endpoint: String,

    /// Name of the environment variable holding the bearer token
    #[serde(default = "default_remote_api_key_env")]
    pub api_key_env: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Tantivy,
    Sqlite,
    Qdrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database file, relative paths resolve under `data_dir`
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    #[serde(default = "default_sqlite_max_connections")]
    pub sqlite_max_connections: u32,

    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    /// Name of the environment variable holding the Qdrant API key
    #[serde(default = "default_qdrant_api_key_env")]
    pub qdrant_api_key_env: String,

    /// Collection metadata cache lifetime
    #[serde(default = "default_metadata_ttl_secs")]
    pub metadata_ttl_secs: u64,

    /// Existence checks after a delete before giving up
    #[serde(default = "default_delete_poll_attempts")]
    pub delete_poll_attempts: u32,

    #[serde(default = "default_delete_poll_interval_ms")]
    pub delete_poll_interval_ms: u64,
}

/// Secondary scoring stage applied to the top-N merged matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankKind {
    #[default]
    None,
    Lexical,
    CrossEncoder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Result count when a query does not specify one
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum backend similarity; weaker matches are dropped
    #[serde(default = "default_relevance_cutoff")]
    pub relevance_cutoff: f32,

    #[serde(default = "default_true")]
    pub hybrid_enabled: bool,

    /// Weight of the lexical score when hybrid is emulated locally
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,

    /// Extra candidates fetched per collection for the local hybrid boost
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,

    #[serde(default)]
    pub rerank: RerankKind,

    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,

    /// fastembed reranker used by `cross_encoder`
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,
}

/// What a second ingestion of a document already in flight does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Wait for the in-flight ingestion, then run
    #[default]
    Wait,
    /// Fail immediately with `IngestionInProgress`
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Concurrent ingestion workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub on_conflict: ConflictPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Timeout for each network call to an embedding or store backend
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level applied to every target without an override
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides, e.g. `store = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_version() -> u32 { 1 }
fn default_data_dir() -> PathBuf { PathBuf::from(".groundwork/data") }
fn default_true() -> bool { true }
fn default_window_size() -> usize { 512 }
fn default_overlap() -> usize { 64 }
fn default_max_bytes() -> u64 { 32 * 1024 * 1024 }
fn default_read_buffer_bytes() -> usize { 64 * 1024 }
fn default_embedding_model() -> String { "AllMiniLML6V2".to_string() }
fn default_dimension() -> usize { 384 }
fn default_max_batch_size() -> usize { 64 }
fn default_max_input_chars() -> usize { 16_384 }
fn default_pool_size() -> usize { 1 }
fn default_remote_endpoint() -> String { "http://localhost:11434/v1".to_string() }
fn default_remote_api_key_env() -> String { "GW_EMBEDDING_API_KEY".to_string() }
fn default_sqlite_path() -> PathBuf { PathBuf::from("vectors.db") }
fn default_sqlite_max_connections() -> u32 { 5 }
fn default_qdrant_url() -> String { "http://localhost:6333".to_string() }
fn default_qdrant_api_key_env() -> String { "GW_QDRANT_API_KEY".to_string() }
fn default_metadata_ttl_secs() -> u64 { 30 }
fn default_delete_poll_attempts() -> u32 { 5 }
fn default_delete_poll_interval_ms() -> u64 { 200 }
fn default_top_k() -> usize { 5 }
fn default_relevance_cutoff() -> f32 { 0.2 }
fn default_lexical_weight() -> f32 { 0.3 }
fn default_candidate_multiplier() -> usize { 3 }
fn default_rerank_top_n() -> usize { 20 }
fn default_rerank_model() -> String { "BGERerankerBase".to_string() }
fn default_workers() -> usize { num_cpus::get().clamp(1, 8) }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 100 }
fn default_max_delay_ms() -> u64 { 2_000 }
fn default_call_timeout_ms() -> u64 { 30_000 }
fn default_log_level() -> String { "warn".to_string() }

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: default_data_dir(),
            chunking: ChunkingConfig::default(),
            loader: LoaderConfig::default(),
            embedding: EmbeddingConfig::default(),
            store: StoreConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingestion: IngestionConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            overlap: default_overlap(),
            tokenizer: TokenizerKind::default(),
        }
    }
}

impl ChunkingConfig {
    pub fn new(window_size: usize, overlap: usize) -> Self {
        Self {
            window_size,
            overlap,
            tokenizer: TokenizerKind::default(),
        }
    }

    pub fn validate(&self) -> RagResult<()> {
        if self.window_size == 0 {
            return Err(RagError::InvalidChunking(
                "window_size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.window_size {
            return Err(RagError::InvalidChunking(format!(
                "overlap ({}) must be smaller than window_size ({})",
                self.overlap, self.window_size
            )));
        }
        Ok(())
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            read_buffer_bytes: default_read_buffer_bytes(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model: default_embedding_model(),
            dimension: default_dimension(),
            max_batch_size: default_max_batch_size(),
            max_input_chars: default_max_input_chars(),
            pool_size: default_pool_size(),
            cache_dir: None,
            remote: RemoteEmbeddingConfig::default(),
        }
    }
}

impl Default for RemoteEmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_remote_endpoint(),
            api_key_env: default_remote_api_key_env(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sqlite_path: default_sqlite_path(),
            sqlite_max_connections: default_sqlite_max_connections(),
            qdrant_url: default_qdrant_url(),
            qdrant_api_key_env: default_qdrant_api_key_env(),
            metadata_ttl_secs: default_metadata_ttl_secs(),
            delete_poll_attempts: default_delete_poll_attempts(),
            delete_poll_interval_ms: default_delete_poll_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub fn delete_poll_interval(&self) -> Duration {
        Duration::from_millis(self.delete_poll_interval_ms)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            relevance_cutoff: default_relevance_cutoff(),
            hybrid_enabled: default_true(),
            lexical_weight: default_lexical_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            rerank: RerankKind::default(),
            rerank_top_n: default_rerank_top_n(),
            rerank_model: default_rerank_model(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            on_conflict: ConflictPolicy::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring `GW_` overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels, single underscore stays
            .merge(Env::prefixed("GW_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find `.groundwork/settings.toml` from the current directory upwards
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Reject combinations no component can work with.
    pub fn validate(&self) -> RagResult<()> {
        self.chunking.validate()?;

        if self.embedding.dimension == 0 {
            return Err(RagError::InvalidConfig(
                "embedding.dimension must be greater than zero".to_string(),
            ));
        }
        if self.embedding.max_batch_size == 0 {
            return Err(RagError::InvalidConfig(
                "embedding.max_batch_size must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.relevance_cutoff) {
            return Err(RagError::InvalidConfig(format!(
                "retrieval.relevance_cutoff must be within [0, 1], got {}",
                self.retrieval.relevance_cutoff
            )));
        }
        if !(0.0..=1.0).contains(&self.retrieval.lexical_weight) {
            return Err(RagError::InvalidConfig(format!(
                "retrieval.lexical_weight must be within [0, 1], got {}",
                self.retrieval.lexical_weight
            )));
        }
        if self.ingestion.workers == 0 {
            return Err(RagError::InvalidConfig(
                "ingestion.workers must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RagError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the SQLite database path against `data_dir`.
    pub fn sqlite_path(&self) -> PathBuf {
        if self.store.sqlite_path.is_absolute() {
            self.store.sqlite_path.clone()
        } else {
            self.data_dir.join(&self.store.sqlite_path)
        }
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file under `root`
    pub fn init_config_file(
        root: impl AsRef<Path>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = root.as_ref().join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}
