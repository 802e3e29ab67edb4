use async_trait::async_trait;

use super::db::Db;
use crate::error::StorageError;
use crate::pdb::models::ProfileId;

/// Durable set of fully processed profiles.
///
/// Completion is tracked per id, not as a single counter, because workers
/// finish out of order and a failed id can sit below later successes.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn is_complete(&self, id: ProfileId) -> Result<bool, StorageError>;
    async fn mark_complete(&self, id: ProfileId) -> Result<(), StorageError>;
    async fn highest_complete(&self) -> Result<Option<ProfileId>, StorageError>;
    async fn count_complete(&self) -> Result<i64, StorageError>;
}

#[async_trait]
impl CheckpointStore for Db {
    async fn is_complete(&self, id: ProfileId) -> Result<bool, StorageError> {
        let hit: Option<i64> = sqlx::query_scalar("SELECT id FROM processed_profiles WHERE id = ?1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(hit.is_some())
    }

    async fn mark_complete(&self, id: ProfileId) -> Result<(), StorageError> {
        sqlx::query("INSERT OR REPLACE INTO processed_profiles (id) VALUES (?1)")
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn highest_complete(&self) -> Result<Option<ProfileId>, StorageError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM processed_profiles")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(ProfileId))
    }

    async fn count_complete(&self) -> Result<i64, StorageError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_profiles")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
