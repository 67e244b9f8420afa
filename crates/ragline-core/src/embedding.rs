//! Embedding model trait and vector utilities.
//!
//! Defines the [`EmbeddingModel`] trait every embedding backend implements,
//! a deterministic offline [`HashEmbedder`], and pure helpers for vector
//! serialization and similarity.
//!
//! Network-backed models (OpenAI-compatible, Ollama, fastembed) and the
//! batching/retry wrapper live in the `ragline` app crate.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

/// A text embedding backend with a fixed output dimension.
///
/// Implementations must return exactly one vector per input, in input
/// order, each of length [`dims`](EmbeddingModel::dims). Failures are
/// reported as [`RagError::Validation`] when the input was rejected and
/// [`RagError::Transport`] when the provider could not be reached.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Dimensionality `D` of every returned vector.
    fn dims(&self) -> usize;

    /// Embed a batch of texts.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RagError::validation("query text is empty"));
        }
        self.embed_documents(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::processing("empty embedding response"))
    }
}

/// Check that a provider answered with one `dims`-sized vector per input.
pub fn check_embeddings(expected: usize, dims: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected {
        return Err(RagError::validation(format!(
            "embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        )));
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        return Err(RagError::validation(format!(
            "embedding dimension mismatch: expected {}, got {}",
            dims,
            v.len()
        )));
    }
    Ok(())
}

/// Published output dimension for well-known model names.
pub fn known_dims(model: &str) -> Option<usize> {
    match model {
        "text-embedding-ada-002" | "text-embedding-3-small" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        "all-minilm-l6-v2" | "all-MiniLM-L6-v2" | "sentence-transformers/all-MiniLM-L6-v2" => {
            Some(384)
        }
        "bge-small-en-v1.5" | "multilingual-e5-small" => Some(384),
        "bge-base-en-v1.5" | "nomic-embed-text" | "nomic-embed-text-v1.5" => Some(768),
        "multilingual-e5-base" => Some(768),
        "bge-large-en-v1.5" | "multilingual-e5-large" | "mxbai-embed-large" => Some(1024),
        _ => None,
    }
}

// ============ Hash Embedder ============

/// Feature-hashed bag-of-words embedder.
///
/// Each lowercased alphanumeric token is hashed with SHA-256 into one of
/// `dims` buckets with a ±1 sign; the result is L2-normalised. Texts that
/// share words land close together, which is enough for offline use and
/// deterministic tests. Never fails.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingModel for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Scale `v` to unit length in place. Zero vectors are left alone.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use ragline_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty,
/// mismatched-length, or zero-magnitude inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let v = vec![0.5f32, -1.0, 2.25, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hash_embedder_dimension_and_order() {
        let model = HashEmbedder::new(64);
        let texts = vec![
            "visa requirements".to_string(),
            "".to_string(),
            "passport renewal".to_string(),
        ];
        let vectors = model.embed_documents(&texts).await.unwrap();
        check_embeddings(texts.len(), 64, &vectors).unwrap();
        assert_eq!(vectors[0], model.embed_one("visa requirements"));
        assert_eq!(vectors[2], model.embed_one("passport renewal"));
        assert!(vectors[1].iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_hash_embedder_similarity_tracks_overlap() {
        let model = HashEmbedder::new(256);
        let q = model.embed_query("visa application").await.unwrap();
        let near = model.embed_one("How to file a visa application");
        let far = model.embed_one("Chocolate cake recipe");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let model = HashEmbedder::new(8);
        let err = model.embed_query("   ").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_check_embeddings_mismatch() {
        let err = check_embeddings(2, 3, &[vec![0.0; 3]]).unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = check_embeddings(1, 3, &[vec![0.0; 4]]).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn test_known_dims() {
        assert_eq!(known_dims("text-embedding-3-large"), Some(3072));
        assert_eq!(known_dims("all-minilm-l6-v2"), Some(384));
        assert_eq!(known_dims("mystery"), None);
    }
}
