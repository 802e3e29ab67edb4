use async_trait::async_trait;
use chrono::Utc;
use tracing::error;

use super::db::Db;
use crate::error::StorageError;
use crate::pdb::models::ProfileId;

/// Latest failure per profile, for audit and manual retry triage.
#[async_trait]
pub trait ErrorLog: Send + Sync {
    /// Upsert: a second failure for the same id replaces the first.
    async fn record(&self, id: ProfileId, message: &str) -> Result<(), StorageError>;
    /// Failed ids below `below` that never reached a checkpoint, ascending.
    async fn unresolved_below(&self, below: ProfileId) -> Result<Vec<ProfileId>, StorageError>;
    async fn count(&self) -> Result<i64, StorageError>;
}

/// Report a failure without ever failing the caller. If the error log itself
/// is broken the message only reaches the diagnostic stream.
pub async fn record_failure(log: &dyn ErrorLog, id: ProfileId, message: &str) {
    if let Err(err) = log.record(id, message).await {
        error!(profile_id = %id, original = message, error = %err, "failed to write error log entry");
    }
}

#[async_trait]
impl ErrorLog for Db {
    async fn record(&self, id: ProfileId, message: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO errors (id, error_message, recorded_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET error_message = excluded.error_message, \
             recorded_at = excluded.recorded_at",
        )
        .bind(id.get())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unresolved_below(&self, below: ProfileId) -> Result<Vec<ProfileId>, StorageError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT e.id FROM errors e \
             LEFT JOIN processed_profiles p ON p.id = e.id \
             WHERE p.id IS NULL AND e.id < ?1 ORDER BY e.id",
        )
        .bind(below.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ProfileId).collect())
    }

    async fn count(&self) -> Result<i64, StorageError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM errors")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
