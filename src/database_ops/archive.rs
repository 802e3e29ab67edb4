use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::db::Db;
use super::documents::{write_json_atomic, DocumentDir};
use crate::error::StorageError;
use crate::pdb::models::{CommentThread, ProfileId, ProfileRecord, TypingBreakdown};

/// The three writes that make up one stored profile. Each is an idempotent
/// upsert keyed by profile id.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write_profile(&self, record: &ProfileRecord) -> Result<(), StorageError>;
    async fn write_typing(&self, id: ProfileId, typing: &TypingBreakdown)
        -> Result<(), StorageError>;
    async fn write_comments(&self, id: ProfileId, comments: &[Value]) -> Result<(), StorageError>;
}

/// SQLite `profiles` row plus JSON documents under the data directory.
#[derive(Debug, Clone)]
pub struct ProfileArchive {
    db: Db,
    docs: DocumentDir,
}

impl ProfileArchive {
    pub fn new(db: Db, docs: DocumentDir) -> Self {
        Self { db, docs }
    }

    pub fn documents(&self) -> &DocumentDir {
        &self.docs
    }
}

#[async_trait]
impl RecordSink for ProfileArchive {
    async fn write_profile(&self, record: &ProfileRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO profiles \
             (id, mbti_profile, wiki_description, sub_cat_id, cat_id, property_id, total_vote_counts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(record.id.get())
        .bind(&record.mbti_profile)
        .bind(record.wiki_description_text())
        .bind(record.sub_cat_id)
        .bind(record.cat_id)
        .bind(record.property_id)
        .bind(record.total_vote_counts)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn write_typing(
        &self,
        id: ProfileId,
        typing: &TypingBreakdown,
    ) -> Result<(), StorageError> {
        write_json_atomic(&self.docs.typing_path(id), typing).await
    }

    async fn write_comments(&self, id: ProfileId, comments: &[Value]) -> Result<(), StorageError> {
        write_json_atomic(&self.docs.comments_path(id), comments).await
    }
}

/// Writes a profile, its typing document and its comment thread as one unit
/// from the pipeline's point of view: the first failing write aborts the rest.
///
/// Nothing is rolled back. The caller checkpoints only after `persist`
/// returns `Ok`, so a retry rewrites every piece.
#[derive(Clone)]
pub struct RecordPersister {
    sink: Arc<dyn RecordSink>,
}

impl RecordPersister {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }

    pub async fn persist(
        &self,
        record: &ProfileRecord,
        typing: &TypingBreakdown,
        thread: &CommentThread,
    ) -> Result<(), StorageError> {
        let id = record.id;
        self.sink.write_profile(record).await?;
        self.sink.write_typing(id, typing).await?;
        self.sink.write_comments(id, &thread.items).await?;
        debug!(profile_id = %id, comments = thread.items.len(), "profile persisted");
        Ok(())
    }
}
