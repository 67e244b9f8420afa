//! SQLite-backed [`VectorStore`].
//!
//! Vectors are stored as little-endian `f32` BLOBs next to their chunk
//! metadata and scored by brute-force cosine similarity in process. Keyword
//! search goes through the `vectors_fts` FTS5 index instead. The
//! pool is opened on first use and kept until [`VectorStore::close`];
//! collection dimensions are cached per store instance.
//!
//! # Concurrency
//!
//! `ensure_collection` and `drop_collection` take the schema lock. Upserts,
//! deletes and searches only go through the pool, so they run concurrently
//! with each other. Each upsert is one transaction.
//!
//! # Failures
//!
//! Pool timeouts, IO errors and lock contention are retried with the
//! configured backoff and surface as `UpstreamUnavailable` once exhausted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ragline_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use ragline_core::error::{RagError, Result};
use ragline_core::models::ScoredChunk;
use ragline_core::retrieval::tokenize;
use ragline_core::store::{
    check_delete_selector, rank_results, validate_records, CollectionStats, RecordFilter,
    VectorRecord, VectorStore, MAX_CONTENT_CHARS,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;

use crate::config::VectorStoreConfig;
use crate::db::{self, classify_sqlx};
use crate::migrate;
use crate::retry::{with_retry, RetryPolicy};

const SERVICE: &str = "sqlite";

pub struct SqliteVectorStore {
    path: PathBuf,
    pool: Mutex<Option<SqlitePool>>,
    dimensions: RwLock<HashMap<String, usize>>,
    schema_lock: Mutex<()>,
    retry: RetryPolicy,
    max_content_chars: usize,
}

impl SqliteVectorStore {
    /// No connection is made until the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Mutex::new(None),
            dimensions: RwLock::new(HashMap::new()),
            schema_lock: Mutex::new(()),
            retry: RetryPolicy::new(3, Duration::from_millis(200)),
            max_content_chars: MAX_CONTENT_CHARS,
        }
    }

    pub fn from_config(path: &Path, config: &VectorStoreConfig) -> Self {
        let mut store = Self::new(path);
        store.retry = RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(config.retry_base_ms),
        );
        store.max_content_chars = config.max_content_chars;
        store
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn pool(&self) -> Result<SqlitePool> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let pool = with_retry(&self.retry, SERVICE, None, move || async move {
            let pool = db::open_pool(&self.path).await.map_err(classify_sqlx)?;
            migrate::apply(&pool).await.map_err(classify_sqlx)?;
            Ok(pool)
        })
        .await?;
        tracing::debug!(path = %self.path.display(), "opened vector store pool");
        *slot = Some(pool.clone());
        Ok(pool)
    }

    fn cached_dimension(&self, collection: &str) -> Option<usize> {
        self.dimensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .copied()
    }

    fn cache_dimension(&self, collection: &str, dimension: usize) {
        self.dimensions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.to_string(), dimension);
    }

    async fn lookup_dimension(&self, collection: &str) -> Result<Option<usize>> {
        if let Some(d) = self.cached_dimension(collection) {
            return Ok(Some(d));
        }
        let pool = self.pool().await?;
        let pool = &pool;
        let found: Option<i64> = with_retry(&self.retry, SERVICE, None, move || async move {
            sqlx::query_scalar("SELECT dimension FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_optional(pool)
                .await
                .map_err(classify_sqlx)
        })
        .await?;
        let found = found.map(|d| d as usize);
        if let Some(d) = found {
            self.cache_dimension(collection, d);
        }
        Ok(found)
    }

    async fn dimension(&self, collection: &str) -> Result<usize> {
        self.lookup_dimension(collection)
            .await?
            .ok_or_else(|| RagError::not_found("collection", collection))
    }

    async fn upsert_once(
        &self,
        pool: &SqlitePool,
        collection: &str,
        records: &[VectorRecord],
    ) -> Result<()> {
        let mut tx = pool.begin().await.map_err(classify_sqlx)?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO vectors
                    (collection, id, document_id, chunk_id, chunk_index, generation, content, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_id = excluded.chunk_id,
                    chunk_index = excluded.chunk_index,
                    generation = excluded.generation,
                    content = excluded.content,
                    embedding = excluded.embedding
                "#,
            )
            .bind(collection)
            .bind(&r.id)
            .bind(&r.document_id)
            .bind(&r.chunk_id)
            .bind(r.chunk_index)
            .bind(r.generation as i64)
            .bind(&r.content)
            .bind(vec_to_blob(&r.embedding))
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx)?;
        }
        tx.commit().await.map_err(classify_sqlx)
    }

    async fn search_once(
        &self,
        pool: &SqlitePool,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT seq, id, document_id, chunk_id, chunk_index, generation, content, embedding \
             FROM vectors WHERE collection = ",
        );
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter);

        let rows = qb.build().fetch_all(pool).await.map_err(classify_sqlx)?;
        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.try_get("seq").map_err(classify_sqlx)?;
            let blob: Vec<u8> = row.try_get("embedding").map_err(classify_sqlx)?;
            let embedding = blob_to_vec(&blob);
            let chunk = ScoredChunk {
                document_id: row.try_get("document_id").map_err(classify_sqlx)?,
                chunk_id: row.try_get("chunk_id").map_err(classify_sqlx)?,
                chunk_index: row.try_get("chunk_index").map_err(classify_sqlx)?,
                content: row.try_get("content").map_err(classify_sqlx)?,
                score: cosine_similarity(vector, &embedding),
            };
            scored.push((chunk, seq as u64));
        }
        Ok(rank_results(scored, k))
    }

    async fn keyword_once(
        &self,
        pool: &SqlitePool,
        collection: &str,
        fts_query: &str,
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT v.seq, v.document_id, v.chunk_id, v.chunk_index, v.content, \
             bm25(vectors_fts) AS bm25_rank \
             FROM vectors_fts JOIN vectors v ON v.seq = vectors_fts.rowid \
             WHERE vectors_fts MATCH ",
        );
        qb.push_bind(fts_query.to_string());
        qb.push(" AND v.collection = ");
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY bm25_rank LIMIT ");
        qb.push_bind(k as i64);

        let rows = qb.build().fetch_all(pool).await.map_err(classify_sqlx)?;
        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.try_get("seq").map_err(classify_sqlx)?;
            let rank: f64 = row.try_get("bm25_rank").map_err(classify_sqlx)?;
            let chunk = ScoredChunk {
                document_id: row.try_get("document_id").map_err(classify_sqlx)?,
                chunk_id: row.try_get("chunk_id").map_err(classify_sqlx)?,
                chunk_index: row.try_get("chunk_index").map_err(classify_sqlx)?,
                content: row.try_get("content").map_err(classify_sqlx)?,
                // FTS5 rank is negative; more negative is a better match.
                score: -rank as f32,
            };
            scored.push((chunk, seq as u64));
        }
        Ok(rank_results(scored, k))
    }

    async fn delete_once(
        &self,
        pool: &SqlitePool,
        collection: &str,
        ids: Option<&[String]>,
        filter: Option<&RecordFilter>,
    ) -> Result<usize> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM vectors WHERE collection = ");
        qb.push_bind(collection.to_string());
        match ids {
            Some(ids) => {
                qb.push(" AND id IN (");
                let mut list = qb.separated(", ");
                for id in ids {
                    list.push_bind(id.clone());
                }
                list.push_unseparated(")");
            }
            None => push_filter(&mut qb, filter),
        }
        let result = qb.build().execute(pool).await.map_err(classify_sqlx)?;
        Ok(result.rows_affected() as usize)
    }
}

/// Quote every term so FTS5 operators in user text are matched literally.
/// `None` when the query has no searchable terms.
fn fts_match_query(query: &str) -> Option<String> {
    let terms = tokenize(query);
    if terms.is_empty() {
        return None;
    }
    let quoted: Vec<String> = terms.iter().map(|t| format!("\"{t}\"")).collect();
    Some(quoted.join(" OR "))
}

/// Append `AND field = ?` for each constraint. Field names come from a
/// validated filter, so only known column names reach the SQL text.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: Option<&RecordFilter>) {
    let Some(filter) = filter else {
        return;
    };
    for (field, value) in filter.fields() {
        qb.push(" AND ");
        qb.push(field);
        qb.push(" = ");
        qb.push_bind(value.to_string());
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn max_content_chars(&self) -> usize {
        self.max_content_chars
    }

    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        if dimension == 0 {
            return Err(RagError::validation("collection dimension must be > 0"));
        }
        let _schema = self.schema_lock.lock().await;

        let existing = self.lookup_dimension(name).await?;
        match existing {
            Some(d) if d != dimension => Err(RagError::validation(format!(
                "collection '{name}' has dimension {d}, requested {dimension}"
            ))),
            Some(_) => Ok(()),
            None => {
                let pool = self.pool().await?;
                let pool = &pool;
                with_retry(&self.retry, SERVICE, None, move || async move {
                    sqlx::query(
                        "INSERT OR IGNORE INTO collections (name, dimension, created_at) VALUES (?, ?, ?)",
                    )
                    .bind(name)
                    .bind(dimension as i64)
                    .bind(chrono::Utc::now().timestamp())
                    .execute(pool)
                    .await
                    .map_err(classify_sqlx)
                })
                .await?;
                self.cache_dimension(name, dimension);
                tracing::debug!(collection = name, dimension, "created collection");
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        let dimension = self.dimension(collection).await?;
        validate_records(dimension, self.max_content_chars, records)?;
        if records.is_empty() {
            return Ok(());
        }
        let pool = self.pool().await?;
        with_retry(&self.retry, SERVICE, None, || {
            self.upsert_once(&pool, collection, records)
        })
        .await
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
        let dimension = self.dimension(collection).await?;
        if vector.len() != dimension {
            return Err(RagError::validation(format!(
                "query dimension {} does not match collection dimension {dimension}",
                vector.len()
            )));
        }
        let pool = self.pool().await?;
        with_retry(&self.retry, SERVICE, None, || {
            self.search_once(&pool, collection, vector, k, filter)
        })
        .await
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
        self.dimension(collection).await?;
        let Some(fts_query) = fts_match_query(query) else {
            return Ok(Vec::new());
        };
        let pool = self.pool().await?;
        with_retry(&self.retry, SERVICE, None, || {
            self.keyword_once(&pool, collection, &fts_query, k, filter)
        })
        .await
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
        self.dimension(collection).await?;
        if ids.is_some_and(|ids| ids.is_empty()) {
            return Ok(0);
        }
        let pool = self.pool().await?;
        let removed = with_retry(&self.retry, SERVICE, None, || {
            self.delete_once(&pool, collection, ids, filter)
        })
        .await?;
        tracing::debug!(collection, removed, "deleted vectors");
        Ok(removed)
    }

    async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        let dimension = self.dimension(collection).await?;
        let pool = self.pool().await?;
        let pool = &pool;
        let count: i64 = with_retry(&self.retry, SERVICE, None, move || async move {
            sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE collection = ?")
                .bind(collection)
                .fetch_one(pool)
                .await
                .map_err(classify_sqlx)
        })
        .await?;
        Ok(CollectionStats {
            collection: collection.to_string(),
            count: count as usize,
            dimension,
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let pool = &pool;
        with_retry(&self.retry, SERVICE, None, move || async move {
            sqlx::query_scalar("SELECT name FROM collections ORDER BY name")
                .fetch_all(pool)
                .await
                .map_err(classify_sqlx)
        })
        .await
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        let _schema = self.schema_lock.lock().await;
        let pool = self.pool().await?;
        let pool = &pool;
        let dropped = with_retry(&self.retry, SERVICE, None, move || async move {
            let mut tx = pool.begin().await.map_err(classify_sqlx)?;
            sqlx::query("DELETE FROM vectors WHERE collection = ?")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(classify_sqlx)?;
            let result = sqlx::query("DELETE FROM collections WHERE name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(classify_sqlx)?;
            tx.commit().await.map_err(classify_sqlx)?;
            Ok(result.rows_affected() > 0)
        })
        .await?;
        self.dimensions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(dropped)
    }

    async fn close(&self) -> Result<()> {
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::debug!(path = %self.path.display(), "closed vector store pool");
        }
        self.dimensions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, doc: &str, idx: i64, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            document_id: doc.to_string(),
            chunk_id: format!("chunk-{id}"),
            chunk_index: idx,
            generation: 1,
            content: format!("content {id}"),
            embedding,
        }
    }

    async fn seeded(tmp: &TempDir) -> SqliteVectorStore {
        let store = SqliteVectorStore::new(tmp.path().join("vectors.sqlite"));
        store.ensure_collection("docs", 2).await.unwrap();
        store
            .upsert(
                "docs",
                &[
                    record("x0", "X", 0, vec![1.0, 0.0]),
                    record("x1", "X", 1, vec![0.8, 0.2]),
                    record("x2", "X", 2, vec![0.0, 1.0]),
                    record("y0", "Y", 0, vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_dimension_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        store.close().await.unwrap();

        let reopened = SqliteVectorStore::new(tmp.path().join("vectors.sqlite"));
        reopened.ensure_collection("docs", 2).await.unwrap();
        let err = reopened.ensure_collection("docs", 3).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(reopened.stats("docs").await.unwrap().count, 4);
    }

    #[tokio::test]
    async fn test_filtered_search() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let filter = RecordFilter::document("X");
        let results = store
            .similarity_search("docs", &[1.0, 0.0], 3, Some(&filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.document_id == "X"));
        assert_eq!(results[0].chunk_id, "chunk-x0");
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

        let none = store
            .similarity_search("docs", &[1.0, 0.0], 0, None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_keyword_search_tracks_writes() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let mut visa = record("x1", "X", 1, vec![0.8, 0.2]);
        visa.content = "Visa fees: renewals are paid online".into();
        store.upsert("docs", &[visa]).await.unwrap();

        let hits = store.keyword_search("docs", "visa AND NOT", 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "chunk-x1");
        assert!(hits[0].score > 0.0);

        // The overwritten text is no longer indexed.
        let stale = store.keyword_search("docs", "x1", 5, None).await.unwrap();
        assert!(stale.is_empty());

        let filter = RecordFilter::document("Y");
        let other = store.keyword_search("docs", "visa", 5, Some(&filter)).await.unwrap();
        assert!(other.is_empty());

        store
            .delete("docs", None, Some(&RecordFilter::document("X")))
            .await
            .unwrap();
        assert!(store.keyword_search("docs", "visa", 5, None).await.unwrap().is_empty());
        assert!(store.keyword_search("docs", "\"*", 5, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_integer_filter_fields() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let filter = RecordFilter::document("X").with("chunk_index", 2);
        let results = store
            .similarity_search("docs", &[1.0, 0.0], 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_index, 2);
    }

    #[tokio::test]
    async fn test_upsert_rejects_whole_batch() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let err = store
            .upsert(
                "docs",
                &[record("z0", "Z", 0, vec![1.0, 0.0]), record("z1", "Z", 1, vec![1.0])],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(store.stats("docs").await.unwrap().count, 4);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_duplicate_ids() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        let mut replacement = record("x2", "X", 2, vec![1.0, 0.0]);
        replacement.content = "rewritten".into();
        store.upsert("docs", &[replacement]).await.unwrap();

        assert_eq!(store.stats("docs").await.unwrap().count, 4);
        let filter = RecordFilter::new().with("id", "x2");
        let hit = store
            .similarity_search("docs", &[1.0, 0.0], 1, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hit[0].content, "rewritten");
    }

    #[tokio::test]
    async fn test_delete_by_filter_and_ids() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        assert_eq!(store.delete("docs", None, None).await.unwrap(), 0);
        let removed = store
            .delete("docs", None, Some(&RecordFilter::document("X")))
            .await
            .unwrap();
        assert_eq!(removed, 3);
        let removed = store
            .delete("docs", Some(&["y0".to_string(), "missing".to_string()]), None)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats("docs").await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStore::new(tmp.path().join("v.sqlite"));
        let err = store.stats("nope").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(!store.drop_collection("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_collection() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        assert_eq!(store.list_collections().await.unwrap(), vec!["docs"]);
        assert!(store.drop_collection("docs").await.unwrap());
        assert!(store.list_collections().await.unwrap().is_empty());
        store.ensure_collection("docs", 5).await.unwrap();
        assert_eq!(store.stats("docs").await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_close_then_reuse_reopens() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp).await;
        store.close().await.unwrap();
        assert_eq!(store.stats("docs").await.unwrap().count, 4);
    }
}
