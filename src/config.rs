//! TOML configuration.
//!
//! Every section has serde defaults, so a minimal file only needs `[db]`:
//!
//! ```toml
//! [db]
//! path = "./data/ragline.sqlite"
//!
//! [chunking]
//! strategy = "recursive"
//! chunk_size = 512
//! chunk_overlap = 50
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! ```
//!
//! Provider and backend keys are typed enums, so an unknown key fails at
//! parse time rather than at first use.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use ragline_core::chunk::{ChunkParams, ChunkStrategy};
use ragline_core::retrieval::RetrievalMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_breakpoint_percentile")]
    pub semantic_breakpoint_percentile: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            semantic_breakpoint_percentile: default_breakpoint_percentile(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            strategy: self.strategy,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            breakpoint_percentile: self.semantic_breakpoint_percentile,
        }
    }
}

fn default_strategy() -> ChunkStrategy {
    ChunkStrategy::Recursive
}
fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_breakpoint_percentile() -> f32 {
    90.0
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Hash,
    OpenAI,
    Ollama,
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for OpenAI-compatible or Ollama servers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_embed_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_embed_retries(),
            timeout_secs: default_embed_timeout(),
            retry_base_ms: default_embed_retry_base_ms(),
        }
    }
}

const HASH_DEFAULT_DIMS: usize = 384;

fn default_embedding_provider() -> EmbeddingProviderKind {
    EmbeddingProviderKind::Hash
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    5
}
fn default_embed_timeout() -> u64 {
    30
}
fn default_embed_retry_base_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_vector_backend")]
    pub backend: VectorBackend,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_store_retries")]
    pub max_retries: u32,
    #[serde(default = "default_store_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            collection: default_collection(),
            max_retries: default_store_retries(),
            retry_base_ms: default_store_retry_base_ms(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

fn default_vector_backend() -> VectorBackend {
    VectorBackend::Sqlite
}
fn default_collection() -> String {
    "documents".to_string()
}
fn default_store_retries() -> u32 {
    3
}
fn default_store_retry_base_ms() -> u64 {
    200
}
fn default_max_content_chars() -> usize {
    ragline_core::store::MAX_CONTENT_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Embedding batches in flight per document.
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
    /// Delete older generations once a re-ingestion completes.
    #[serde(default = "default_true")]
    pub replace_previous: bool,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            embed_concurrency: default_embed_concurrency(),
            replace_previous: true,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_embed_concurrency() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// `vector`, `keyword` or `hybrid`.
    #[serde(default)]
    pub mode: RetrievalMode,
    /// Weight of the vector score in hybrid mode, in `[0, 1]`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            mode: RetrievalMode::default(),
            hybrid_alpha: default_hybrid_alpha(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

fn default_hybrid_alpha() -> f32 {
    0.7
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    Words,
    Hf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_max_token_limit")]
    pub max_token_limit: usize,
    #[serde(default = "default_tokenizer")]
    pub tokenizer: TokenizerKind,
    /// `tokenizer.json` used when `tokenizer = "hf"`.
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_token_limit: default_max_token_limit(),
            tokenizer: default_tokenizer(),
            tokenizer_path: None,
        }
    }
}

fn default_max_token_limit() -> usize {
    4000
}
fn default_tokenizer() -> TokenizerKind {
    TokenizerKind::Words
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompletionProviderKind {
    Disabled,
    OpenAI,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_provider")]
    pub provider: CompletionProviderKind,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first attempt on transient failures.
    #[serde(default = "default_completion_retries")]
    pub max_retries: u32,
    #[serde(default = "default_completion_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            model: default_completion_model(),
            url: None,
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_completion_timeout(),
            max_retries: default_completion_retries(),
            retry_base_ms: default_completion_retry_base_ms(),
        }
    }
}

fn default_completion_provider() -> CompletionProviderKind {
    CompletionProviderKind::Disabled
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.7
}
fn default_completion_timeout() -> u64 {
    60
}
fn default_completion_retries() -> u32 {
    2
}
fn default_completion_retry_base_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EmbeddingConfig {
    /// Configured dimension, falling back to the model's published one.
    /// The hash embedder defaults to 384.
    pub fn resolved_dims(&self) -> Option<usize> {
        if self.provider == EmbeddingProviderKind::Hash {
            return Some(self.dims.unwrap_or(HASH_DEFAULT_DIMS));
        }
        self.dims.or_else(|| {
            self.model
                .as_deref()
                .and_then(ragline_core::embedding::known_dims)
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let chunking = &config.chunking;
    if let Err(e) = chunking.params().validate() {
        bail!("chunking: {}", e);
    }
    if chunking.chunk_size > config.vector_store.max_content_chars {
        bail!(
            "chunking.chunk_size ({}) exceeds vector_store.max_content_chars ({})",
            chunking.chunk_size,
            config.vector_store.max_content_chars
        );
    }

    let embedding = &config.embedding;
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    match embedding.provider {
        EmbeddingProviderKind::Local => {}
        EmbeddingProviderKind::Hash => {
            if embedding.resolved_dims() == Some(0) {
                bail!("embedding.dims must be > 0 for the hash provider");
            }
        }
        EmbeddingProviderKind::OpenAI | EmbeddingProviderKind::Ollama => {
            if embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{:?}'",
                    embedding.provider
                );
            }
            if embedding.resolved_dims().unwrap_or(0) == 0 {
                bail!(
                    "embedding.dims must be > 0 when provider is '{:?}' and the model is not well known",
                    embedding.provider
                );
            }
        }
    }

    if config.vector_store.collection.trim().is_empty() {
        bail!("vector_store.collection must not be empty");
    }
    if config.ingest.embed_concurrency == 0 {
        bail!("ingest.embed_concurrency must be >= 1");
    }
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.memory.max_token_limit == 0 {
        bail!("memory.max_token_limit must be >= 1");
    }
    if config.memory.tokenizer == TokenizerKind::Hf && config.memory.tokenizer_path.is_none() {
        bail!("memory.tokenizer_path is required when memory.tokenizer = \"hf\"");
    }
    if !(0.0..=2.0).contains(&config.completion.temperature) {
        bail!("completion.temperature must be in [0.0, 2.0]");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config("[db]\npath = \"/tmp/r.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.chunking.strategy, ChunkStrategy::Recursive);
        assert_eq!(config.embedding.provider, EmbeddingProviderKind::Hash);
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.vector_store.backend, VectorBackend::Sqlite);
        assert_eq!(config.vector_store.collection, "documents");
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.mode, RetrievalMode::Vector);
        assert_eq!(config.retrieval.hybrid_alpha, 0.7);
        assert_eq!(config.memory.max_token_limit, 4000);
        assert_eq!(config.completion.provider, CompletionProviderKind::Disabled);
    }

    #[test]
    fn test_overlap_not_smaller_than_size_rejected() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(parse_config("[db]\npath = \"x\"\n[chunking]\nstrategy = \"tokens\"\n").is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"cohere\"\n").is_err());
    }

    #[test]
    fn test_openai_infers_known_dims() {
        let config = parse_config(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-large\"\n",
        )
        .unwrap();
        assert_eq!(config.embedding.resolved_dims(), Some(3072));
    }

    #[test]
    fn test_openai_requires_model() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_chunk_size_bounded_by_content_limit() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[chunking]\nchunk_size = 9000\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_content_chars"));
    }

    #[test]
    fn test_hf_tokenizer_needs_path() {
        assert!(parse_config("[db]\npath = \"x\"\n[memory]\ntokenizer = \"hf\"\n").is_err());
    }

    #[test]
    fn test_retrieval_mode_and_alpha() {
        let config = parse_config(
            "[db]\npath = \"x\"\n[retrieval]\nmode = \"hybrid\"\nhybrid_alpha = 0.25\n",
        )
        .unwrap();
        assert_eq!(config.retrieval.mode, RetrievalMode::Hybrid);
        assert_eq!(config.retrieval.hybrid_alpha, 0.25);

        let err = parse_config("[db]\npath = \"x\"\n[retrieval]\nhybrid_alpha = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("hybrid_alpha"));
        assert!(parse_config("[db]\npath = \"x\"\n[retrieval]\nmode = \"fuzzy\"\n").is_err());
    }

    #[test]
    fn test_completion_retry_keys() {
        let defaults = parse_config("[db]\npath = \"x\"\n").unwrap();
        assert_eq!(defaults.completion.max_retries, 2);
        assert_eq!(defaults.completion.retry_base_ms, 1000);

        let config = parse_config(
            "[db]\npath = \"x\"\n[completion]\nmax_retries = 0\nretry_base_ms = 50\n",
        )
        .unwrap();
        assert_eq!(config.completion.max_retries, 0);
        assert_eq!(config.completion.retry_base_ms, 50);
    }
}
