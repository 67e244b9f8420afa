//! SQLite implementations of the document and message repositories.
//!
//! Both share one pool with the vector store tables (see [`crate::migrate`]).
//! Timestamps are stored as Unix milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ragline_core::error::{RagError, Result};
use ragline_core::models::{ChatMessage, Document, DocumentStatus, Role, SourceType};
use ragline_core::store::{DocumentRepository, MessageRepository};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::{classify_insert, classify_sqlx};

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub struct SqliteDocumentRepository {
    pool: SqlitePool,
}

impl SqliteDocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.try_get("status").map_err(classify_sqlx)?;
    let source_type: String = row.try_get("source_type").map_err(classify_sqlx)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(classify_sqlx)?;
    let chunk_count: i64 = row.try_get("chunk_count").map_err(classify_sqlx)?;
    let generation: i64 = row.try_get("generation").map_err(classify_sqlx)?;
    let deleted: i64 = row.try_get("deleted").map_err(classify_sqlx)?;

    Ok(Document {
        id: row.try_get("id").map_err(classify_sqlx)?,
        owner_id: row.try_get("owner_id").map_err(classify_sqlx)?,
        title: row.try_get("title").map_err(classify_sqlx)?,
        source_type: SourceType::parse(&source_type)?,
        status: DocumentStatus::parse(&status)?,
        metadata: serde_json::from_str(&metadata_json)?,
        created_at: millis_to_datetime(row.try_get("created_at").map_err(classify_sqlx)?),
        updated_at: millis_to_datetime(row.try_get("updated_at").map_err(classify_sqlx)?),
        error: row.try_get("error").map_err(classify_sqlx)?,
        chunk_count: chunk_count as usize,
        generation: generation as u32,
        deleted: deleted != 0,
    })
}

#[async_trait]
impl DocumentRepository for SqliteDocumentRepository {
    async fn create(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, owner_id, title, source_type, status, metadata_json, created_at,
                 updated_at, error, chunk_count, generation, deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.title)
        .bind(doc.source_type.as_str())
        .bind(doc.status.as_str())
        .bind(serde_json::to_string(&doc.metadata)?)
        .bind(doc.created_at.timestamp_millis())
        .bind(doc.updated_at.timestamp_millis())
        .bind(&doc.error)
        .bind(doc.chunk_count as i64)
        .bind(doc.generation as i64)
        .bind(doc.deleted as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_insert(e, &format!("document {}", doc.id)))?;
        Ok(())
    }

    async fn update(&self, doc: &Document) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET
                owner_id = ?, title = ?, source_type = ?, status = ?, metadata_json = ?,
                updated_at = ?, error = ?, chunk_count = ?, generation = ?, deleted = ?
            WHERE id = ?
            "#,
        )
        .bind(&doc.owner_id)
        .bind(&doc.title)
        .bind(doc.source_type.as_str())
        .bind(doc.status.as_str())
        .bind(serde_json::to_string(&doc.metadata)?)
        .bind(doc.updated_at.timestamp_millis())
        .bind(&doc.error)
        .bind(doc.chunk_count as i64)
        .bind(doc.generation as i64)
        .bind(doc.deleted as i64)
        .bind(&doc.id)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(RagError::not_found("document", &doc.id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Document>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query(
                    "SELECT * FROM documents WHERE owner_id = ? ORDER BY created_at DESC, id ASC",
                )
                .bind(owner)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM documents ORDER BY created_at DESC, id ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(classify_sqlx)?;
        rows.iter().map(row_to_document).collect()
    }
}

pub struct SqliteMessageRepository {
    pool: SqlitePool,
}

impl SqliteMessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for SqliteMessageRepository {
    async fn append(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, timestamp, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .bind(serde_json::to_string(&message.metadata)?)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_insert(e, &format!("message {}", message.id)))?;
        Ok(())
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, timestamp, metadata_json
            FROM messages
            WHERE conversation_id = ?
            ORDER BY timestamp ASC, seq ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        rows.iter()
            .map(|row| {
                let role: String = row.try_get("role").map_err(classify_sqlx)?;
                let metadata_json: String = row.try_get("metadata_json").map_err(classify_sqlx)?;
                Ok(ChatMessage {
                    id: row.try_get("id").map_err(classify_sqlx)?,
                    conversation_id: row.try_get("conversation_id").map_err(classify_sqlx)?,
                    role: Role::normalize(&role)?,
                    content: row.try_get("content").map_err(classify_sqlx)?,
                    timestamp: millis_to_datetime(row.try_get("timestamp").map_err(classify_sqlx)?),
                    metadata: serde_json::from_str(&metadata_json)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn pool(tmp: &TempDir) -> SqlitePool {
        let pool = db::open_pool(&tmp.path().join("records.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_document_create_get_update() {
        let tmp = TempDir::new().unwrap();
        let repo = SqliteDocumentRepository::new(pool(&tmp).await);

        let mut doc = Document::new("d1", "Handbook", SourceType::Pdf);
        doc.owner_id = Some("alice".into());
        doc.metadata = serde_json::json!({"pages": 3});
        repo.create(&doc).await.unwrap();

        let err = repo.create(&doc).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        doc.start_processing().unwrap();
        doc.complete(7).unwrap();
        repo.update(&doc).await.unwrap();

        let loaded = repo.get("d1").await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Completed);
        assert_eq!(loaded.chunk_count, 7);
        assert_eq!(loaded.source_type, SourceType::Pdf);
        assert_eq!(loaded.metadata["pages"], 3);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let tmp = TempDir::new().unwrap();
        let repo = SqliteDocumentRepository::new(pool(&tmp).await);
        let doc = Document::new("ghost", "Ghost", SourceType::Text);
        assert_eq!(repo.update(&doc).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_list_by_owner() {
        let tmp = TempDir::new().unwrap();
        let repo = SqliteDocumentRepository::new(pool(&tmp).await);
        for (id, owner) in [("a", "alice"), ("b", "bob"), ("c", "alice")] {
            let mut doc = Document::new(id, id, SourceType::Text);
            doc.owner_id = Some(owner.into());
            repo.create(&doc).await.unwrap();
        }
        let alice = repo.list(Some("alice")).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|d| d.owner_id.as_deref() == Some("alice")));
        assert_eq!(repo.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_messages_chronological() {
        let tmp = TempDir::new().unwrap();
        let repo = SqliteMessageRepository::new(pool(&tmp).await);
        let base = Utc::now();
        for (i, role) in [Role::User, Role::Assistant, Role::User].into_iter().enumerate() {
            repo.append(&ChatMessage {
                id: format!("m{i}"),
                conversation_id: "c1".into(),
                role,
                content: format!("message {i}"),
                timestamp: base + chrono::Duration::milliseconds(i as i64),
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
        }
        let log = repo.list("c1").await.unwrap();
        let ids: Vec<&str> = log.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
        assert_eq!(log[1].role, Role::Assistant);
        assert!(repo.list("other").await.unwrap().is_empty());

        let dup = repo.append(&log[0]).await.unwrap_err();
        assert_eq!(dup.kind(), "conflict");
    }
}
