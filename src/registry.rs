//! Startup wiring.
//!
//! Every pluggable piece is picked by a typed config key and constructed
//! once here:
//!
//! | Config key | Choices |
//! |------------|---------|
//! | `embedding.provider` | `hash`, `openai`, `ollama`, `local` |
//! | `vector_store.backend` | `sqlite`, `memory` |
//! | `memory.tokenizer` | `words`, `hf` |
//! | `completion.provider` | `disabled`, `openai` |
//!
//! [`Components`] owns the results and their shutdown order. Consumers get
//! references to it; nothing is reachable through globals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ragline_core::store::memory::InMemoryVectorStore;
use ragline_core::store::{DocumentRepository, MessageRepository, VectorStore};
use ragline_core::tokens::TokenCounter;
use sqlx::SqlitePool;

use crate::chat::ChatService;
use crate::completion::{CompletionModel, DisabledCompletion, OpenAICompletion};
use crate::config::{CompletionProviderKind, Config, TokenizerKind, VectorBackend};
use crate::db;
use crate::embedding::EmbeddingClient;
use crate::loader::LoaderRegistry;
use crate::memory::ChatMemoryManager;
use crate::migrate;
use crate::processor::{DocumentProcessor, ProcessorSettings};
use crate::sqlite_records::{SqliteDocumentRepository, SqliteMessageRepository};
use crate::sqlite_store::SqliteVectorStore;
use crate::tokenizer;

const URL_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_embedder(config: &Config) -> Result<Arc<EmbeddingClient>> {
    let client = EmbeddingClient::from_config(&config.embedding, config.ingest.embed_concurrency)
        .with_context(|| format!("embedding provider {:?}", config.embedding.provider))?;
    Ok(Arc::new(client))
}

pub fn build_vector_store(config: &Config) -> Arc<dyn VectorStore> {
    match config.vector_store.backend {
        VectorBackend::Sqlite => Arc::new(SqliteVectorStore::from_config(
            &config.db.path,
            &config.vector_store,
        )),
        VectorBackend::Memory => Arc::new(
            InMemoryVectorStore::new().with_max_content_chars(config.vector_store.max_content_chars),
        ),
    }
}

pub fn build_token_counter(config: &Config) -> Result<Arc<dyn TokenCounter>> {
    match config.memory.tokenizer {
        TokenizerKind::Words => Ok(tokenizer::words()),
        TokenizerKind::Hf => {
            let path = config
                .memory
                .tokenizer_path
                .as_deref()
                .context("memory.tokenizer_path is required for the hf tokenizer")?;
            Ok(tokenizer::load_hf(path)?)
        }
    }
}

pub fn build_completion(config: &Config) -> Result<Arc<dyn CompletionModel>> {
    match config.completion.provider {
        CompletionProviderKind::Disabled => Ok(Arc::new(DisabledCompletion)),
        CompletionProviderKind::OpenAI => Ok(Arc::new(
            OpenAICompletion::new(&config.completion).context("completion provider openai")?,
        )),
    }
}

/// Everything a command needs, built from one config.
pub struct Components {
    pub pool: SqlitePool,
    pub store: Arc<dyn VectorStore>,
    pub documents: Arc<dyn DocumentRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub processor: DocumentProcessor,
    pub memory: ChatMemoryManager,
    pub chat: ChatService,
}

impl Components {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await.context("apply schema")?;

        let store = build_vector_store(config);
        let documents: Arc<dyn DocumentRepository> =
            Arc::new(SqliteDocumentRepository::new(pool.clone()));
        let messages: Arc<dyn MessageRepository> =
            Arc::new(SqliteMessageRepository::new(pool.clone()));

        let processor = DocumentProcessor::new(
            LoaderRegistry::with_defaults(URL_FETCH_TIMEOUT)?,
            build_embedder(config)?,
            Arc::clone(&store),
            Arc::clone(&documents),
            ProcessorSettings::from_config(config),
        );
        let memory = ChatMemoryManager::new(
            Arc::clone(&messages),
            build_token_counter(config)?,
            config.memory.max_token_limit,
        );
        let chat = ChatService::new(
            memory.clone(),
            processor.clone(),
            build_completion(config)?,
            config.retrieval.top_k,
        );

        tracing::debug!(
            backend = store.backend(),
            embedding = ?config.embedding.provider,
            tokenizer = memory.token_counter().name(),
            "components ready"
        );
        Ok(Self {
            pool,
            store,
            documents,
            messages,
            processor,
            memory,
            chat,
        })
    }

    /// Cancel background runs, then release the store and the pool.
    pub async fn shutdown(self) {
        self.processor.shutdown().await;
        if let Err(e) = self.store.close().await {
            tracing::warn!(error = %e, "vector store close failed");
        }
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use ragline_core::embedding::EmbeddingModel;
    use tempfile::TempDir;

    fn config(tmp: &TempDir, extra: &str) -> Config {
        let path = tmp.path().join("ragline.sqlite");
        parse_config(&format!("[db]\npath = {:?}\n{extra}", path.to_string_lossy())).unwrap()
    }

    #[test]
    fn test_backend_selection() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(build_vector_store(&config(&tmp, "")).backend(), "sqlite");
        let memory = config(&tmp, "[vector_store]\nbackend = \"memory\"\n");
        assert_eq!(build_vector_store(&memory).backend(), "memory");
    }

    #[test]
    fn test_default_embedder_is_hash() {
        let tmp = TempDir::new().unwrap();
        let embedder = build_embedder(&config(&tmp, "")).unwrap();
        assert_eq!(embedder.dims(), 384);
    }

    #[tokio::test]
    async fn test_components_round_trip() {
        let tmp = TempDir::new().unwrap();
        let components = Components::from_config(&config(&tmp, "")).await.unwrap();
        let stats = components.processor.collection_stats().await.unwrap();
        assert_eq!(stats.count, 0);
        assert_eq!(components.memory.token_counter().name(), "words");
        components.shutdown().await;
        assert!(tmp.path().join("ragline.sqlite").exists());
    }
}
