//! SQLite bootstrap: pool creation and idempotent schema.

use crate::error::{DbError, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;

/// Database handle owning the SQLite pool.
#[derive(Debug, Clone)]
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    /// Open (creating if missing) the database file and ensure the schema.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::Connect)?;

        ensure_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Create the users table if it does not exist. Safe to run on every startup.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            status TEXT NOT NULL DEFAULT 'alive',
            status_updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_step_sent INTEGER NOT NULL DEFAULT 0,
            send_in_progress INTEGER NOT NULL DEFAULT 0,
            send_marked_at TIMESTAMP,
            last_send_attempt_at TIMESTAMP,
            trigger_fired INTEGER NOT NULL DEFAULT 0,
            trigger_fired_at TIMESTAMP,
            first_message_at TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|error| DbError::Schema(error.to_string()))?;

    Ok(())
}
