//! Embedding providers and the batching client.
//!
//! Concrete [`EmbeddingModel`] implementations:
//! - **[`HashEmbedder`]**: offline feature-hashing, from `ragline-core`.
//! - **[`OpenAIEmbedder`]**: any OpenAI-compatible `/v1/embeddings` endpoint.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed`.
//! - **`LocalEmbedder`**: fastembed, behind `--features local-embeddings-fastembed`.
//!
//! Providers make exactly one request per call. [`EmbeddingClient`] wraps a
//! provider and adds what the pipeline needs on top:
//!
//! ```text
//! texts ─▶ split into batch_size ─▶ ≤ concurrency batches in flight ─▶ in-order results
//!                                     │
//!                                     └─ each batch: retry Transport with backoff,
//!                                        then check count and dimension
//! ```
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx, connection errors, timeouts → retried
//! - Other HTTP 4xx → validation error, never retried
//! - Backoff: `retry_base_ms` doubled per attempt, capped at 32×

#[cfg(feature = "local-embeddings-fastembed")]
mod local;
mod ollama;
mod openai;

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalEmbedder;
pub use ollama::OllamaEmbedder;
pub use openai::OpenAIEmbedder;
pub use ragline_core::embedding::HashEmbedder;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt, TryStreamExt};
use ragline_core::embedding::{check_embeddings, EmbeddingModel};
use ragline_core::error::{RagError, Result};
use tokio_util::sync::CancellationToken;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::retry::{with_retry, RetryPolicy};

/// Batching, bounded-concurrency, retrying wrapper around a provider.
pub struct EmbeddingClient {
    inner: Arc<dyn EmbeddingModel>,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(
        inner: Arc<dyn EmbeddingModel>,
        batch_size: usize,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            retry,
        }
    }

    /// Resolve the configured provider and wrap it.
    pub fn from_config(config: &EmbeddingConfig, concurrency: usize) -> Result<Self> {
        let retry = RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(config.retry_base_ms),
        );
        Ok(Self::new(
            create_model(config)?,
            config.batch_size,
            concurrency,
            retry,
        ))
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embed `texts` batch by batch. The stream yields one item per batch of
    /// `batch_size` inputs, in input order, with up to `concurrency` batches
    /// in flight.
    pub fn embed_batches<'a>(
        &'a self,
        texts: &'a [String],
        cancel: Option<&'a CancellationToken>,
    ) -> impl Stream<Item = Result<Vec<Vec<f32>>>> + Send + 'a {
        stream::iter(texts.chunks(self.batch_size))
            .map(move |batch| self.embed_batch(batch, cancel))
            .buffered(self.concurrency)
    }

    async fn embed_batch(
        &self,
        batch: &[String],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Vec<f32>>> {
        let service = format!("embedding:{}", self.inner.model_name());
        let vectors = with_retry(&self.retry, &service, cancel, || {
            self.inner.embed_documents(batch)
        })
        .await?;
        check_embeddings(batch.len(), self.inner.dims(), &vectors)?;
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingModel for EmbeddingClient {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let batches: Vec<Vec<Vec<f32>>> = self.embed_batches(texts, None).try_collect().await?;
        Ok(batches.into_iter().flatten().collect())
    }
}

/// Create the configured provider.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires `local-embeddings-fastembed`) |
pub fn create_model(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingModel>> {
    let dims = config.resolved_dims();
    match config.provider {
        EmbeddingProviderKind::Hash => Ok(Arc::new(HashEmbedder::new(dims.unwrap_or(384)))),
        EmbeddingProviderKind::OpenAI => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        EmbeddingProviderKind::Ollama => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        EmbeddingProviderKind::Local => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        EmbeddingProviderKind::Local => Err(RagError::validation(
            "local embedding provider requires --features local-embeddings-fastembed",
        )),
    }
}

/// Pull `model` and `dims` out of the config for network providers.
pub(crate) fn required_model(config: &EmbeddingConfig) -> Result<(String, usize)> {
    let model = config.model.clone().ok_or_else(|| {
        RagError::validation(format!(
            "embedding.model required for the {:?} provider",
            config.provider
        ))
    })?;
    let dims = config.resolved_dims().ok_or_else(|| {
        RagError::validation(format!("embedding.dims required for model '{model}'"))
    })?;
    Ok((model, dims))
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::processing(format!("http client: {e}")))
}

/// Read a JSON array of numbers as an `f32` vector.
pub(crate) fn json_vector(value: &serde_json::Value, what: &str) -> Result<Vec<f32>> {
    let arr = value
        .as_array()
        .ok_or_else(|| RagError::processing(format!("invalid {what} response: embedding is not an array")))?;
    arr.iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RagError::processing(format!("invalid {what} response: non-numeric value")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records batch sizes and fails the first `fail_first` calls with a
    /// transport error.
    struct Scripted {
        dims: usize,
        calls: AtomicUsize,
        fail_first: usize,
        batches: Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn new(dims: usize, fail_first: usize) -> Self {
            Self {
                dims,
                calls: AtomicUsize::new(0),
                fail_first,
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingModel for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(RagError::transport("scripted", "connection reset"));
            }
            self.batches.lock().unwrap().push(texts.len());
            Ok(texts
                .iter()
                .map(|t| {
                    let n: f32 = t.trim_start_matches('t').parse().unwrap();
                    vec![n; self.dims]
                })
                .collect())
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{i}")).collect()
    }

    fn fast_retry(n: u32) -> RetryPolicy {
        RetryPolicy::new(n, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_splits_batches_and_preserves_order() {
        let model = Arc::new(Scripted::new(3, 0));
        let client = EmbeddingClient::new(model.clone(), 4, 3, fast_retry(0));
        let out = client.embed_documents(&texts(10)).await.unwrap();
        assert_eq!(out.len(), 10);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(v, &vec![i as f32; 3]);
        }
        let mut sizes = model.batches.lock().unwrap().clone();
        sizes.sort();
        assert_eq!(sizes, vec![2, 4, 4]);
    }

    #[tokio::test]
    async fn test_retries_transport_errors() {
        let model = Arc::new(Scripted::new(2, 2));
        let client = EmbeddingClient::new(model.clone(), 8, 1, fast_retry(3));
        let v = client.embed_query("t5").await.unwrap();
        assert_eq!(v, vec![5.0, 5.0]);
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_upstream_unavailable() {
        let model = Arc::new(Scripted::new(2, 100));
        let client = EmbeddingClient::new(model, 8, 1, fast_retry(2));
        let err = client.embed_documents(&texts(3)).await.unwrap_err();
        assert_eq!(err.kind(), "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_validation() {
        struct Liar;
        #[async_trait]
        impl EmbeddingModel for Liar {
            fn model_name(&self) -> &str {
                "liar"
            }
            fn dims(&self) -> usize {
                4
            }
            async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Ok(texts.iter().map(|_| vec![0.0; 3]).collect())
            }
        }
        let client = EmbeddingClient::new(Arc::new(Liar), 8, 1, fast_retry(3));
        let err = client.embed_documents(&texts(2)).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_every_vector_has_declared_dimension() {
        let config = EmbeddingConfig {
            dims: Some(48),
            ..EmbeddingConfig::default()
        };
        let client = EmbeddingClient::from_config(&config, 2).unwrap();
        assert_eq!(client.dims(), 48);
        let docs = client
            .embed_documents(&["alpha".into(), "beta gamma".into(), "".into()])
            .await
            .unwrap();
        assert!(docs.iter().all(|v| v.len() == 48));
        assert_eq!(client.embed_query("alpha").await.unwrap().len(), 48);
    }

    #[test]
    fn test_openai_without_model_rejected() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderKind::OpenAI,
            ..EmbeddingConfig::default()
        };
        let err = create_model(&config).err().unwrap();
        assert_eq!(err.kind(), "validation");
    }
}
