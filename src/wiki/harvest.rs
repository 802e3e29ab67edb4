//! Second pass over stored profiles: for public figures (`property_id = 1`)
//! and fictional characters (`property_id = 2`) fetch the encyclopedia page
//! named by the profile label and store it as `{id}_wiki.json`.
use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::client::WikipediaClient;
use super::{EncyclopediaLookup, WikiDocument};
use crate::config::HarvestConfig;
use crate::database_ops::db::Db;
use crate::database_ops::documents::{write_json_atomic, DocumentDir};
use crate::error::StorageError;
use crate::pdb::models::ProfileId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiCandidate {
    pub id: ProfileId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WikiOutcome {
    Saved,
    /// No page under that title; recorded and not asked again.
    Missing,
    /// Lookup or write failed; recorded and retried on the next run.
    Failed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WikiSummary {
    pub candidates: usize,
    pub saved: usize,
    pub missing: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Labelled profiles with an encyclopedia-eligible property and no
/// `wiki_processed` row, ascending by id.
pub async fn pending_candidates(db: &Db) -> Result<Vec<WikiCandidate>, StorageError> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT p.id, p.mbti_profile FROM profiles p \
         LEFT JOIN wiki_processed w ON w.id = p.id \
         WHERE p.property_id IN (1, 2) AND w.id IS NULL \
           AND p.mbti_profile IS NOT NULL AND TRIM(p.mbti_profile) <> '' \
         ORDER BY p.id",
    )
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, name)| WikiCandidate {
            id: ProfileId(id),
            name,
        })
        .collect())
}

pub async fn mark_wiki_processed(db: &Db, id: ProfileId) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO wiki_processed (id, processed_at) VALUES (?1, ?2) \
         ON CONFLICT(id) DO UPDATE SET processed_at = excluded.processed_at",
    )
    .bind(id.get())
    .bind(Utc::now().to_rfc3339())
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Append to `wiki_errors`. A failed insert is logged and dropped.
pub async fn record_wiki_error(db: &Db, candidate: &WikiCandidate, message: &str) {
    let res = sqlx::query(
        "INSERT INTO wiki_errors (celeb_id, celeb_name, error_message) VALUES (?1, ?2, ?3)",
    )
    .bind(candidate.id.get())
    .bind(&candidate.name)
    .bind(message)
    .execute(&db.pool)
    .await;
    if let Err(err) = res {
        error!(profile_id = %candidate.id, original = message, error = %err, "failed to write wiki error entry");
    }
}

pub async fn count_wiki_processed(db: &Db) -> Result<i64, StorageError> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM wiki_processed")
        .fetch_one(&db.pool)
        .await?)
}

pub async fn count_wiki_errors(db: &Db) -> Result<i64, StorageError> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM wiki_errors")
        .fetch_one(&db.pool)
        .await?)
}

#[derive(Clone)]
pub struct WikiHarvester {
    lookup: Arc<dyn EncyclopediaLookup>,
    db: Db,
    docs: DocumentDir,
    delay: Duration,
    max_workers: usize,
    max_depth: usize,
}

impl WikiHarvester {
    pub fn new(
        lookup: Arc<dyn EncyclopediaLookup>,
        db: Db,
        docs: DocumentDir,
        delay: Duration,
        max_workers: usize,
        max_depth: usize,
    ) -> Self {
        Self {
            lookup,
            db,
            docs,
            delay,
            max_workers: max_workers.max(1),
            max_depth,
        }
    }

    pub fn from_config(cfg: &HarvestConfig, db: Db) -> Result<Self> {
        let client = WikipediaClient::new(&cfg.wiki_api_url, &cfg.wiki_user_agent, cfg.request_timeout())
            .context("failed to build encyclopedia client")?;
        Ok(Self::new(
            Arc::new(client),
            db,
            DocumentDir::new(&cfg.data_dir),
            cfg.wiki_delay(),
            cfg.wiki_max_workers,
            cfg.wiki_max_section_depth,
        ))
    }

    /// Process every pending candidate, `max_workers` at a time. Candidates
    /// not yet started when `cancel` fires are left for the next run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<WikiSummary, StorageError> {
        let candidates = pending_candidates(&self.db).await?;
        info!(count = candidates.len(), "encyclopedia candidates pending");

        let mut summary = WikiSummary {
            candidates: candidates.len(),
            ..WikiSummary::default()
        };
        let outcomes: Vec<Option<WikiOutcome>> = stream::iter(candidates)
            .map(|candidate| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some(self.process_isolated(&candidate).await)
                }
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Some(WikiOutcome::Saved) => summary.saved += 1,
                Some(WikiOutcome::Missing) => summary.missing += 1,
                Some(WikiOutcome::Failed) => summary.failed += 1,
                None => summary.cancelled = true,
            }
        }
        info!(
            saved = summary.saved,
            missing = summary.missing,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "encyclopedia harvest finished"
        );
        Ok(summary)
    }

    /// A panicking lookup fails only its own candidate.
    async fn process_isolated(&self, candidate: &WikiCandidate) -> WikiOutcome {
        match AssertUnwindSafe(self.process(candidate)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(profile_id = %candidate.id, "encyclopedia worker panicked");
                let message = format!("Error processing page '{}': worker panicked", candidate.name);
                record_wiki_error(&self.db, candidate, &message).await;
                WikiOutcome::Failed
            }
        }
    }

    pub async fn process(&self, candidate: &WikiCandidate) -> WikiOutcome {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        info!(profile_id = %candidate.id, name = %candidate.name, "fetching encyclopedia page");

        let page = match self.lookup.lookup(&candidate.name).await {
            Ok(Some(page)) => page,
            Ok(None) => {
                let message = format!("Page '{}' does not exist.", candidate.name);
                warn!(profile_id = %candidate.id, "{message}");
                record_wiki_error(&self.db, candidate, &message).await;
                return match mark_wiki_processed(&self.db, candidate.id).await {
                    Ok(()) => WikiOutcome::Missing,
                    Err(err) => {
                        error!(profile_id = %candidate.id, error = %err, "failed to mark missing page");
                        WikiOutcome::Failed
                    }
                };
            }
            Err(err) => {
                let message = format!("Error fetching page '{}': {err}", candidate.name);
                error!(profile_id = %candidate.id, error = %err, "encyclopedia lookup failed");
                record_wiki_error(&self.db, candidate, &message).await;
                return WikiOutcome::Failed;
            }
        };

        let doc = WikiDocument::from_page(&page, self.max_depth);
        let path = self.docs.wiki_path(candidate.id);
        let stored = async {
            write_json_atomic(&path, &doc).await?;
            mark_wiki_processed(&self.db, candidate.id).await
        }
        .await;
        match stored {
            Ok(()) => {
                info!(profile_id = %candidate.id, path = %path.display(), sections = doc.sections.len(), "saved encyclopedia page");
                WikiOutcome::Saved
            }
            Err(err) => {
                let message = format!("Error saving page '{}': {err}", page.title);
                error!(profile_id = %candidate.id, error = %err, "failed to store encyclopedia page");
                record_wiki_error(&self.db, candidate, &message).await;
                WikiOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::archive::{ProfileArchive, RecordSink};
    use crate::database_ops::documents::read_json;
    use crate::error::FetchError;
    use crate::pdb::models::ProfileRecord;
    use crate::wiki::{EncyclopediaPage, Section};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Catalogue;

    #[async_trait]
    impl EncyclopediaLookup for Catalogue {
        async fn lookup(&self, title: &str) -> Result<Option<EncyclopediaPage>, FetchError> {
            match title {
                "Frida Kahlo" => Ok(Some(EncyclopediaPage {
                    title: title.into(),
                    url: "https://en.wikipedia.org/wiki/Frida_Kahlo".into(),
                    summary: "Painter.".into(),
                    sections: vec![Section {
                        title: "Life".into(),
                        level: 1,
                        text: "Born in Coyoacán.".into(),
                        subsections: vec![],
                    }],
                    categories: vec!["Category:Painters".into()],
                })),
                "Offline" => Err(FetchError::transport("u", "connection reset")),
                _ => Ok(None),
            }
        }
    }

    async fn seeded() -> (tempfile::TempDir, Db, DocumentDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::connect(&dir.path().join("w.db"), 2).await.unwrap();
        let docs = DocumentDir::new(dir.path().join("data"));
        let archive = ProfileArchive::new(db.clone(), docs.clone());
        for (id, name, property) in [
            (1, "Frida Kahlo", 1),
            (2, "Nobody Real", 2),
            (3, "Offline", 1),
            (4, "A Band", 5),
        ] {
            archive
                .write_profile(&ProfileRecord {
                    id: ProfileId(id),
                    mbti_profile: name.into(),
                    wiki_description: Value::Null,
                    sub_cat_id: 0,
                    cat_id: 0,
                    property_id: property,
                    total_vote_counts: 0,
                })
                .await
                .unwrap();
        }
        (dir, db, docs)
    }

    #[tokio::test]
    async fn harvests_eligible_profiles_and_records_failures() {
        let (_dir, db, docs) = seeded().await;
        let candidates = pending_candidates(&db).await.unwrap();
        assert_eq!(
            candidates.iter().map(|c| c.id.get()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let harvester = WikiHarvester::new(
            Arc::new(Catalogue),
            db.clone(),
            docs.clone(),
            Duration::ZERO,
            2,
            16,
        );
        let summary = harvester.run(CancellationToken::new()).await.unwrap();
        assert_eq!(
            summary,
            WikiSummary {
                candidates: 3,
                saved: 1,
                missing: 1,
                failed: 1,
                cancelled: false
            }
        );

        let doc: WikiDocument = read_json(&docs.wiki_path(ProfileId(1))).await.unwrap();
        assert_eq!(doc.sections["Life"], "Born in Coyoacán.");

        let messages: Vec<(i64, String)> =
            sqlx::query_as("SELECT celeb_id, error_message FROM wiki_errors ORDER BY celeb_id")
                .fetch_all(&db.pool)
                .await
                .unwrap();
        assert_eq!(messages[0], (2, "Page 'Nobody Real' does not exist.".to_string()));
        assert_eq!(messages[1].0, 3);

        // Only the transport failure is retried.
        let remaining = pending_candidates(&db).await.unwrap();
        assert_eq!(remaining.iter().map(|c| c.id.get()).collect::<Vec<_>>(), vec![3]);
        assert_eq!(count_wiki_processed(&db).await.unwrap(), 2);
        assert_eq!(count_wiki_errors(&db).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelled_run_starts_nothing() {
        let (_dir, db, docs) = seeded().await;
        let harvester =
            WikiHarvester::new(Arc::new(Catalogue), db.clone(), docs, Duration::ZERO, 1, 16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = harvester.run(cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.saved + summary.missing + summary.failed, 0);
        assert_eq!(count_wiki_processed(&db).await.unwrap(), 0);
    }

    struct Exploding;

    #[async_trait]
    impl EncyclopediaLookup for Exploding {
        async fn lookup(&self, title: &str) -> Result<Option<EncyclopediaPage>, FetchError> {
            panic!("lookup exploded on {title}");
        }
    }

    #[tokio::test]
    async fn panicking_lookup_fails_only_its_candidates() {
        let (_dir, db, docs) = seeded().await;
        let harvester =
            WikiHarvester::new(Arc::new(Exploding), db.clone(), docs, Duration::ZERO, 2, 16);

        let summary = harvester.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.failed, 3);
        assert!(!summary.cancelled);
        assert_eq!(count_wiki_errors(&db).await.unwrap(), 3);
        assert_eq!(count_wiki_processed(&db).await.unwrap(), 0);
        assert_eq!(pending_candidates(&db).await.unwrap().len(), 3);
    }
}
