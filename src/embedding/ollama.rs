//! Ollama embeddings (`POST {url}/api/embed`).
//!
//! Requires Ollama running with an embedding model pulled
//! (e.g. `ollama pull nomic-embed-text`).

use async_trait::async_trait;
use ragline_core::embedding::EmbeddingModel;
use ragline_core::error::{RagError, Result};

use super::{http_client, json_vector, required_model};
use crate::config::EmbeddingConfig;
use crate::retry::{classify_reqwest, classify_status};

pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model(config)?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url,
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(url = %self.url, "ollama unreachable, is it running?");
                classify_reqwest("ollama", e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status("ollama", status, &body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest("ollama", e))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| RagError::processing("invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|e| json_vector(e, "Ollama"))
        .collect()
}
