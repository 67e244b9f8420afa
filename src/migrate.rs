//! Schema creation. Every statement is idempotent, so `apply` runs on
//! every startup as well as from `ragline init`.

use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        owner_id TEXT,
        title TEXT NOT NULL,
        source_type TEXT NOT NULL,
        status TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        error TEXT,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        generation INTEGER NOT NULL DEFAULT 1,
        deleted INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_id)",
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        conversation_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS collections (
        name TEXT PRIMARY KEY,
        dimension INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vectors (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        document_id TEXT NOT NULL,
        chunk_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        generation INTEGER NOT NULL,
        content TEXT NOT NULL,
        embedding BLOB NOT NULL,
        UNIQUE(collection, id),
        FOREIGN KEY (collection) REFERENCES collections(name) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_vectors_document ON vectors(collection, document_id)",
];

/// Keep `vectors_fts` in step with `vectors`. Upserts that hit the unique
/// key go through the update trigger.
const FTS_TRIGGERS: &[&str] = &[
    r#"
    CREATE TRIGGER IF NOT EXISTS vectors_fts_insert AFTER INSERT ON vectors BEGIN
        INSERT INTO vectors_fts(rowid, content) VALUES (new.seq, new.content);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS vectors_fts_delete AFTER DELETE ON vectors BEGIN
        INSERT INTO vectors_fts(vectors_fts, rowid, content) VALUES ('delete', old.seq, old.content);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS vectors_fts_update AFTER UPDATE ON vectors BEGIN
        INSERT INTO vectors_fts(vectors_fts, rowid, content) VALUES ('delete', old.seq, old.content);
        INSERT INTO vectors_fts(rowid, content) VALUES (new.seq, new.content);
    END
    "#,
];

pub async fn apply(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }

    // FTS5 virtual table over chunk text for keyword retrieval
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'vectors_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            "CREATE VIRTUAL TABLE vectors_fts USING fts5(content, content='vectors', content_rowid='seq')",
        )
        .execute(pool)
        .await?;
        // Index rows written before the table existed.
        sqlx::query("INSERT INTO vectors_fts(vectors_fts) VALUES ('rebuild')")
            .execute(pool)
            .await?;
    }

    for statement in FTS_TRIGGERS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::open_pool(&tmp.path().join("m.sqlite")).await.unwrap();
        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for expected in ["collections", "documents", "messages", "vectors", "vectors_fts"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
        pool.close().await;
    }
}
