//! Local inference with fastembed.
//!
//! The model is downloaded from Hugging Face on first use, then loaded once
//! and reused. Inference runs on the blocking pool.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ragline_core::embedding::EmbeddingModel;
use ragline_core::error::{RagError, Result};

use crate::config::EmbeddingConfig;

pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    engine: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        fastembed_model(&model_name)?;
        let dims = config
            .dims
            .or_else(|| ragline_core::embedding::known_dims(&model_name))
            .unwrap_or(384);
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            engine: Arc::new(Mutex::new(None)),
        })
    }
}

fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(RagError::validation(format!(
            "unknown local embedding model '{other}'"
        ))),
    }
}

#[async_trait]
impl EmbeddingModel for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let engine = self.engine.clone();
        let model_name = self.model_name.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = engine.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed_model(&model_name)?)
                        .with_show_download_progress(false),
                )
                .map_err(|e| RagError::processing(format!("failed to load {model_name}: {e}")))?;
                *guard = Some(model);
            }
            let Some(model) = guard.as_mut() else {
                return Err(RagError::processing("local embedding model unavailable"));
            };
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| RagError::validation(format!("local embedding failed: {e}")))
        })
        .await
        .map_err(|e| RagError::processing(format!("embedding task panicked: {e}")))?
    }
}
