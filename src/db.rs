//! SQLite connection handling.

use std::path::Path;
use std::time::Duration;

use ragline_core::error::RagError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::Config;

/// Open a pool on `path`, creating the file and its parent directory.
pub async fn open_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
}

pub async fn connect(config: &Config) -> anyhow::Result<SqlitePool> {
    Ok(open_pool(&config.db.path).await?)
}

/// Pool exhaustion, closed pools, IO and lock contention are transient;
/// everything else is a processing failure.
pub fn classify_sqlx(err: sqlx::Error) -> RagError {
    let transient = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("busy")
        }
        _ => false,
    };
    if transient {
        RagError::transport("sqlite", err)
    } else {
        RagError::processing(format!("sqlite: {err}"))
    }
}

/// Like [`classify_sqlx`], mapping unique-key violations to `Conflict`.
pub fn classify_insert(err: sqlx::Error, what: &str) -> RagError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return RagError::Conflict(format!("{what} already exists"));
        }
    }
    classify_sqlx(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(classify_sqlx(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(classify_sqlx(sqlx::Error::PoolClosed).is_retryable());
        assert!(!classify_sqlx(sqlx::Error::RowNotFound).is_retryable());
    }

    #[tokio::test]
    async fn test_open_pool_creates_parent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("db.sqlite");
        let pool = open_pool(&path).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }
}
