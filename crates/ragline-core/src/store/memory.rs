//! In-memory backends for tests and single-process deployments.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. Vector search is brute-force
//! cosine similarity over every record of the collection; keyword search
//! scores the same records with BM25.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{RagError, Result};
use crate::models::{ChatMessage, Document, ScoredChunk};
use crate::retrieval::bm25_scores;

use super::{
    check_delete_selector, rank_results, validate_records, CollectionStats, DocumentRepository,
    MessageRepository, RecordFilter, VectorRecord, VectorStore, MAX_CONTENT_CHARS,
};

struct Collection {
    dimension: usize,
    /// id -> (insertion sequence, record)
    records: HashMap<String, (u64, VectorRecord)>,
    next_seq: u64,
}

/// In-memory [`VectorStore`].
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
    max_content_chars: usize,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            max_content_chars: MAX_CONTENT_CHARS,
        }
    }

    pub fn with_max_content_chars(mut self, max: usize) -> Self {
        self.max_content_chars = max;
        self
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(name: &str) -> RagError {
    RagError::not_found("collection", name)
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn max_content_chars(&self) -> usize {
        self.max_content_chars
    }

    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        if dimension == 0 {
            return Err(RagError::validation("collection dimension must be > 0"));
        }
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        match collections.get(name) {
            Some(c) if c.dimension != dimension => Err(RagError::validation(format!(
                "collection '{name}' has dimension {}, requested {dimension}",
                c.dimension
            ))),
            Some(_) => Ok(()),
            None => {
                collections.insert(
                    name.to_string(),
                    Collection {
                        dimension,
                        records: HashMap::new(),
                        next_seq: 0,
                    },
                );
                tracing::debug!(collection = name, dimension, "created collection");
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let c = collections.get_mut(collection).ok_or_else(|| missing(collection))?;
        validate_records(c.dimension, self.max_content_chars, records)?;

        for r in records {
            let seq = match c.records.get(&r.id) {
                Some((seq, _)) => *seq,
                None => {
                    c.next_seq += 1;
                    c.next_seq
                }
            };
            c.records.insert(r.id.clone(), (seq, r.clone()));
        }
        Ok(())
    }

    async fn similarity_search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if let Some(f) = filter {
            f.validate()?;
        }
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let c = collections.get(collection).ok_or_else(|| missing(collection))?;
        if vector.len() != c.dimension {
            return Err(RagError::validation(format!(
                "query dimension {} does not match collection dimension {}",
                vector.len(),
                c.dimension
            )));
        }

        let scored = c
            .records
            .values()
            .filter(|(_, r)| filter.map_or(true, |f| f.matches(r)))
            .map(|(seq, r)| (r.to_scored(cosine_similarity(vector, &r.embedding)), *seq))
            .collect();
        Ok(rank_results(scored, k))
    }

    async fn keyword_search(
        &self,
        collection: &str,
        query: &str,
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if let Some(f) = filter {
            f.validate()?;
        }
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let c = collections.get(collection).ok_or_else(|| missing(collection))?;

        let candidates: Vec<&(u64, VectorRecord)> = c
            .records
            .values()
            .filter(|(_, r)| filter.map_or(true, |f| f.matches(r)))
            .collect();
        let scores = {
            let texts: Vec<&str> = candidates.iter().map(|(_, r)| r.content.as_str()).collect();
            bm25_scores(query, &texts)
        };
        let scored = scores
            .into_iter()
            .zip(candidates)
            .filter(|(score, _)| *score > 0.0)
            .map(|(score, (seq, r))| (r.to_scored(score), *seq))
            .collect();
        Ok(rank_results(scored, k))
    }

    async fn delete(
        &self,
        collection: &str,
        ids: Option<&[String]>,
        filter: Option<&RecordFilter>,
    ) -> Result<usize> {
        if !check_delete_selector(ids, filter)? {
            return Ok(0);
        }
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let c = collections.get_mut(collection).ok_or_else(|| missing(collection))?;
        let before = c.records.len();
        match (ids, filter) {
            (Some(ids), _) => {
                for id in ids {
                    c.records.remove(id);
                }
            }
            (None, Some(f)) => c.records.retain(|_, (_, r)| !f.matches(r)),
            (None, None) => {}
        }
        Ok(before - c.records.len())
    }

    async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let c = collections.get(collection).ok_or_else(|| missing(collection))?;
        Ok(CollectionStats {
            collection: collection.to_string(),
            count: c.records.len(),
            dimension: c.dimension,
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        Ok(collections.remove(name).is_some())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ============ Repositories ============

/// In-memory [`DocumentRepository`].
#[derive(Default)]
pub struct InMemoryDocumentRepository {
    docs: RwLock<HashMap<String, Document>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn create(&self, doc: &Document) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        if docs.contains_key(&doc.id) {
            return Err(RagError::Conflict(format!("document {} already exists", doc.id)));
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn update(&self, doc: &Document) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        match docs.get_mut(&doc.id) {
            Some(slot) => {
                *slot = doc.clone();
                Ok(())
            }
            None => Err(RagError::not_found("document", &doc.id)),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(id).cloned())
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Document>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Document> = docs
            .values()
            .filter(|d| owner_id.map_or(true, |o| d.owner_id.as_deref() == Some(o)))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

/// In-memory [`MessageRepository`].
#[derive(Default)]
pub struct InMemoryMessageRepository {
    conversations: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn append(&self, message: &ChatMessage) -> Result<()> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let log = conversations
            .entry(message.conversation_id.clone())
            .or_default();
        if log.iter().any(|m| m.id == message.id) {
            return Err(RagError::Conflict(format!("message {} already exists", message.id)));
        }
        log.push(message.clone());
        Ok(())
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let conversations = self
            .conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut log = conversations.get(conversation_id).cloned().unwrap_or_default();
        log.sort_by_key(|m| m.timestamp);
        Ok(log)
    }
}
