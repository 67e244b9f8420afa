//! OpenAI-compatible embeddings (`POST {url}/v1/embeddings`).
//!
//! Works against api.openai.com and local servers speaking the same
//! protocol (LM Studio, vLLM). The API key is read from the environment
//! variable named by `embedding.api_key_env`; it is optional for local
//! servers.

use async_trait::async_trait;
use ragline_core::embedding::EmbeddingModel;
use ragline_core::error::{RagError, Result};

use super::{http_client, json_vector, required_model};
use crate::config::EmbeddingConfig;
use crate::retry::{classify_reqwest, classify_status};

const DEFAULT_URL: &str = "https://api.openai.com";

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model(config)?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() && url == DEFAULT_URL {
            return Err(RagError::validation(format!(
                "{} environment variable not set",
                config.api_key_env
            )));
        }

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url,
            model,
            dims,
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingModel for OpenAIEmbedder {
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

        let mut request = self
            .client
            .post(format!("{}/v1/embeddings", self.url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest("openai", e))?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status("openai", status, &body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest("openai", e))?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::processing("invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| RagError::processing("invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, json_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reorders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let out = parse_openai_response(&json).unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn test_parse_missing_data() {
        let err = parse_openai_response(&serde_json::json!({"error": "x"})).unwrap_err();
        assert_eq!(err.kind(), "processing");
    }

    #[test]
    fn test_local_server_needs_no_key() {
        let config = EmbeddingConfig {
            provider: crate::config::EmbeddingProviderKind::OpenAI,
            model: Some("nomic-embed-text".into()),
            url: Some("http://127.0.0.1:1234/".into()),
            api_key_env: "RAGLINE_TEST_UNSET_KEY".into(),
            ..EmbeddingConfig::default()
        };
        let embedder = OpenAIEmbedder::new(&config).unwrap();
        assert_eq!(embedder.dims(), 768);
        assert_eq!(embedder.url, "http://127.0.0.1:1234");
    }
}
