//! Storage abstractions for ragline.
//!
//! [`VectorStore`] persists chunk vectors and answers similarity queries.
//! [`DocumentRepository`] and [`MessageRepository`] are the keyed record
//! stores the pipeline and chat memory use for status and message
//! persistence. All three are async (via `async-trait`) and `Send + Sync`.
//!
//! # Vector store operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`ensure_collection`](VectorStore::ensure_collection) | Create or validate a collection's dimension |
//! | [`upsert`](VectorStore::upsert) | All-or-nothing batch write, duplicate ids overwrite |
//! | [`similarity_search`](VectorStore::similarity_search) | Top-k cosine search with exact-match filter |
//! | [`delete`](VectorStore::delete) | Remove by ids or by filter |
//! | [`stats`](VectorStore::stats) | Record count and dimension |
//! | [`close`](VectorStore::close) | Release cached handles |

pub mod memory;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::models::{ChatMessage, Document, ScoredChunk};

/// Upper bound on stored chunk content, in characters.
pub const MAX_CONTENT_CHARS: usize = 8192;

/// Fields a [`RecordFilter`] may constrain.
pub const FILTER_FIELDS: &[&str] = &["id", "document_id", "chunk_id", "chunk_index", "generation"];

/// One chunk as stored in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: i64,
    pub generation: u32,
    pub content: String,
    pub embedding: Vec<f32>,
}

impl VectorRecord {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "document_id" => Some(self.document_id.clone()),
            "chunk_id" => Some(self.chunk_id.clone()),
            "chunk_index" => Some(self.chunk_index.to_string()),
            "generation" => Some(self.generation.to_string()),
            _ => None,
        }
    }

    pub fn to_scored(&self, score: f32) -> ScoredChunk {
        ScoredChunk {
            document_id: self.document_id.clone(),
            chunk_id: self.chunk_id.clone(),
            chunk_index: self.chunk_index,
            content: self.content.clone(),
            score,
        }
    }
}

/// Exact-match metadata filter. All constraints must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    fields: BTreeMap<String, String>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(document_id: impl Into<String>) -> Self {
        Self::new().with("document_id", document_id.into())
    }

    pub fn with(mut self, field: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(field.into(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn validate(&self) -> Result<()> {
        for key in self.fields.keys() {
            if !FILTER_FIELDS.contains(&key.as_str()) {
                return Err(RagError::validation(format!(
                    "unknown filter field '{key}' (expected one of {})",
                    FILTER_FIELDS.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, record: &VectorRecord) -> bool {
        self.fields
            .iter()
            .all(|(k, v)| record.field(k).as_deref() == Some(v.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub collection: String,
    pub count: usize,
    pub dimension: usize,
}

/// A pluggable vector database.
///
/// Writes to one collection are concurrent with each other and with
/// searches; `ensure_collection` is serialized against other schema
/// changes. Transient backend failures are retried internally and
/// surface as [`RagError::UpstreamUnavailable`] once exhausted.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend label for logs (`"memory"`, `"sqlite"`).
    fn backend(&self) -> &'static str;

    /// Longest record `content` accepted by [`VectorStore::upsert`].
    fn max_content_chars(&self) -> usize {
        MAX_CONTENT_CHARS
    }

    /// Create `name` with `dimension` if absent. An existing collection
    /// with a different dimension is a [`RagError::Validation`].
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()>;

    /// Write all records or none of them.
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()>;

    /// At most `k` results, descending score, ties by lower `chunk_index`
    /// then insertion order. `k == 0` yields nothing.
    async fn similarity_search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<ScoredChunk>>;

    /// At most `k` records whose text shares a term with `query`, ranked by
    /// BM25 (higher is better) with the same tie rules as
    /// [`similarity_search`](Self::similarity_search). A query with no
    /// searchable terms yields nothing.
    async fn keyword_search(
        &self,
        collection: &str,
        query: &str,
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Remove records by id list or by filter and return how many went.
    /// Supplying neither is a logged no-op.
    async fn delete(
        &self,
        collection: &str,
        ids: Option<&[String]>,
        filter: Option<&RecordFilter>,
    ) -> Result<usize>;

    async fn stats(&self, collection: &str) -> Result<CollectionStats>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Returns `false` when the collection did not exist.
    async fn drop_collection(&self, name: &str) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// Validate a batch against a collection before any of it is written.
pub fn validate_records(dimension: usize, max_content: usize, records: &[VectorRecord]) -> Result<()> {
    for r in records {
        if r.id.is_empty() {
            return Err(RagError::validation("record id must not be empty"));
        }
        if r.embedding.len() != dimension {
            return Err(RagError::validation(format!(
                "record {}: embedding dimension {} does not match collection dimension {}",
                r.id,
                r.embedding.len(),
                dimension
            )));
        }
        let chars = r.content.chars().count();
        if chars > max_content {
            return Err(RagError::validation(format!(
                "record {}: content is {} chars, limit is {}",
                r.id, chars, max_content
            )));
        }
    }
    Ok(())
}

/// Check the delete selector: exactly one of `ids`/`filter`, or neither.
/// Returns `false` for the no-op case.
pub fn check_delete_selector(ids: Option<&[String]>, filter: Option<&RecordFilter>) -> Result<bool> {
    match (ids, filter) {
        (Some(_), Some(_)) => Err(RagError::validation(
            "delete takes either ids or a filter, not both",
        )),
        (None, None) => {
            tracing::warn!("delete called without ids or filter, nothing removed");
            Ok(false)
        }
        (None, Some(f)) if f.is_empty() => {
            tracing::warn!("delete called with an empty filter, nothing removed");
            Ok(false)
        }
        (None, Some(f)) => {
            f.validate()?;
            Ok(true)
        }
        (Some(_), None) => Ok(true),
    }
}

/// Sort `(chunk, insertion_seq)` pairs into final result order and keep `k`.
pub fn rank_results(mut scored: Vec<(ScoredChunk, u64)>, k: usize) -> Vec<ScoredChunk> {
    scored.sort_by(|(a, sa), (b, sb)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.chunk_index.cmp(&b.chunk_index))
            .then(sa.cmp(sb))
    });
    scored.truncate(k);
    scored.into_iter().map(|(c, _)| c).collect()
}

/// Durable document records.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// [`RagError::Conflict`] if the id already exists.
    async fn create(&self, doc: &Document) -> Result<()>;

    /// [`RagError::NotFound`] if the id does not exist.
    async fn update(&self, doc: &Document) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Document>>;

    /// Documents of one owner (all documents for `None`), newest first.
    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Document>>;
}

/// Append-only conversation logs.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// [`RagError::Conflict`] if the message id already exists.
    async fn append(&self, message: &ChatMessage) -> Result<()>;

    /// Messages of a conversation in chronological order.
    async fn list(&self, conversation_id: &str) -> Result<Vec<ChatMessage>>;
}
