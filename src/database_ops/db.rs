use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::StorageError;

/// Tables created on connect. Statements are idempotent so every start can run them.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS profiles (
        id INTEGER PRIMARY KEY,
        mbti_profile TEXT,
        wiki_description TEXT,
        sub_cat_id INTEGER,
        cat_id INTEGER,
        property_id INTEGER,
        total_vote_counts INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS processed_profiles (
        id INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS errors (
        id INTEGER PRIMARY KEY,
        error_message TEXT
    )",
    "CREATE TABLE IF NOT EXISTS wiki_processed (
        id INTEGER PRIMARY KEY,
        processed_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS wiki_errors (
        error_id INTEGER PRIMARY KEY AUTOINCREMENT,
        celeb_id INTEGER,
        celeb_name TEXT,
        error_message TEXT,
        error_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS profiles_property_idx ON profiles (property_id)",
];

#[derive(Clone, Debug)]
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    /// Open (or create) the SQLite file and bring the schema up to date.
    ///
    /// WAL plus a busy timeout lets every worker write its checkpoint or error
    /// row concurrently without `database is locked` failures.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn connect(path: &Path, max_connections: u32) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;
        info!(max_connections, "connected to sqlite");

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        // Databases created by older runs lack the error timestamp.
        if !self.column_exists("errors", "recorded_at").await? {
            sqlx::query("ALTER TABLE errors ADD COLUMN recorded_at TEXT")
                .execute(&self.pool)
                .await?;
            debug!("added errors.recorded_at");
        }
        Ok(())
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> Result<bool, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2")
                .bind(table)
                .bind(column)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
