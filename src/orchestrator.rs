//! Worker pool that drives every profile id through
//! skip-check → fetch → assemble → persist → checkpoint.
use anyhow::{Context, Result};
use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HarvestConfig;
use crate::database_ops::archive::{ProfileArchive, RecordPersister};
use crate::database_ops::checkpoint::CheckpointStore;
use crate::database_ops::db::Db;
use crate::database_ops::documents::DocumentDir;
use crate::database_ops::error_log::{record_failure, ErrorLog};
use crate::error::{ErrorKind, HarvestError, StorageError};
use crate::pdb::comments::CommentCollector;
use crate::pdb::models::{ProfileId, ProfileRecord, TypingBreakdown};
use crate::pdb::provider::{Fetcher, HttpFetcher};
use crate::pdb::proxy::ProxyProvider;
use crate::pdb::ApiEndpoints;

const PROGRESS_EVERY: usize = 50;

/// Tagged result of one identifier. Failures have already been written to the
/// error log by the time this value exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileOutcome {
    Completed { comments: usize, partial_thread: bool },
    AlreadyComplete,
    Failed(ErrorKind),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub partial_threads: usize,
    pub failures: BTreeMap<ErrorKind, usize>,
    /// Set when a stop request left ids undispatched.
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: &ProfileOutcome) {
        match outcome {
            ProfileOutcome::Completed { partial_thread, .. } => {
                self.completed += 1;
                if *partial_thread {
                    self.partial_threads += 1;
                }
            }
            ProfileOutcome::AlreadyComplete => self.skipped += 1,
            ProfileOutcome::Failed(kind) => {
                self.failed += 1;
                *self.failures.entry(*kind).or_default() += 1;
            }
        }
    }

    pub fn finished(&self) -> usize {
        self.completed + self.skipped + self.failed
    }
}

/// Collaborators of the pipeline. Everything sits behind a trait object so the
/// pool can be driven against fakes.
#[derive(Clone)]
pub struct HarvestParts {
    pub fetcher: Arc<dyn Fetcher>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub errors: Arc<dyn ErrorLog>,
    pub persister: RecordPersister,
}

#[derive(Clone)]
pub struct Harvester {
    fetcher: Arc<dyn Fetcher>,
    checkpoints: Arc<dyn CheckpointStore>,
    errors: Arc<dyn ErrorLog>,
    persister: RecordPersister,
    collector: CommentCollector,
    endpoints: ApiEndpoints,
    max_workers: usize,
}

impl Harvester {
    pub fn new(
        parts: HarvestParts,
        endpoints: ApiEndpoints,
        max_workers: usize,
        max_comment_pages: usize,
    ) -> Self {
        let collector =
            CommentCollector::new(parts.fetcher.clone(), endpoints.clone(), max_comment_pages);
        Self {
            fetcher: parts.fetcher,
            checkpoints: parts.checkpoints,
            errors: parts.errors,
            persister: parts.persister,
            collector,
            endpoints,
            max_workers: max_workers.max(1),
        }
    }

    /// Production wiring: reqwest fetcher, SQLite checkpoints and errors,
    /// profile rows plus JSON documents under `data_dir`.
    pub fn from_config(cfg: &HarvestConfig, db: Db) -> Result<Self> {
        let proxies = ProxyProvider::new(cfg.proxy_mode(), cfg.request_timeout())
            .context("failed to build proxy pool client")?;
        let fetcher = HttpFetcher::new(
            proxies,
            cfg.proxy_required(),
            cfg.request_delay(),
            cfg.request_timeout(),
        )
        .context("failed to build HTTP client")?;
        let archive = ProfileArchive::new(db.clone(), DocumentDir::new(&cfg.data_dir));
        let db = Arc::new(db);

        Ok(Self::new(
            HarvestParts {
                fetcher: Arc::new(fetcher),
                checkpoints: db.clone(),
                errors: db,
                persister: RecordPersister::new(Arc::new(archive)),
            },
            ApiEndpoints::new(&cfg.api_base_url),
            cfg.max_workers,
            cfg.max_comment_pages,
        ))
    }

    /// Process `ids` with at most `max_workers` in flight.
    ///
    /// Each distinct id is handed to exactly one task; repeats in the input are
    /// dropped. After `cancel` fires no new id is dispatched, while the ids
    /// already in flight run to their checkpoint or error entry.
    pub async fn run<I>(&self, ids: I, cancel: CancellationToken) -> RunSummary
    where
        I: IntoIterator<Item = ProfileId>,
    {
        let mut pending = ids.into_iter();
        let mut seen: HashSet<ProfileId> = HashSet::new();
        let mut set: JoinSet<ProfileOutcome> = JoinSet::new();
        let mut summary = RunSummary::default();

        loop {
            while set.len() < self.max_workers && !cancel.is_cancelled() {
                let Some(id) = pending.by_ref().find(|id| seen.insert(*id)) else {
                    break;
                };
                let this = self.clone();
                summary.dispatched += 1;
                set.spawn(async move { this.process_isolated(id).await });
            }

            match set.join_next().await {
                Some(Ok(outcome)) => {
                    summary.record(&outcome);
                    if summary.finished() % PROGRESS_EVERY == 0 {
                        info!(
                            finished = summary.finished(),
                            completed = summary.completed,
                            skipped = summary.skipped,
                            failed = summary.failed,
                            "progress"
                        );
                    }
                }
                Some(Err(join_err)) => {
                    // process_isolated already catches panics; this is a cancelled task.
                    error!(error = %join_err, "worker task ended abnormally");
                    summary.record(&ProfileOutcome::Failed(ErrorKind::WorkerPanic));
                }
                None => break,
            }
        }

        if cancel.is_cancelled() && pending.next().is_some() {
            summary.cancelled = true;
            warn!(dispatched = summary.dispatched, "stop requested; remaining ids left for the next run");
        }
        info!(
            dispatched = summary.dispatched,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            partial_threads = summary.partial_threads,
            "harvest run finished"
        );
        summary
    }

    /// `process` with panics turned into an error-log entry instead of
    /// unwinding into the pool.
    async fn process_isolated(&self, id: ProfileId) -> ProfileOutcome {
        match AssertUnwindSafe(self.process(id)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(profile_id = %id, "worker panicked");
                record_failure(self.errors.as_ref(), id, "WorkerPanic: processing panicked").await;
                ProfileOutcome::Failed(ErrorKind::WorkerPanic)
            }
        }
    }

    /// Run one id through the full state machine. Never returns an error:
    /// failures become an error-log entry and a `Failed` outcome.
    pub async fn process(&self, id: ProfileId) -> ProfileOutcome {
        match self.try_process(id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(profile_id = %id, kind = %err.kind(), error = %err, "profile failed");
                record_failure(self.errors.as_ref(), id, &err.audit_message()).await;
                ProfileOutcome::Failed(err.kind())
            }
        }
    }

    async fn try_process(&self, id: ProfileId) -> Result<ProfileOutcome, HarvestError> {
        if self.checkpoints.is_complete(id).await? {
            debug!(profile_id = %id, "already processed; skipping");
            return Ok(ProfileOutcome::AlreadyComplete);
        }

        let payload = self.fetcher.get_json(&self.endpoints.profile_url(id)).await?;
        let record = ProfileRecord::from_payload(id, &payload)?;
        let typing = TypingBreakdown::from_payload(&payload)?;
        let thread = self.collector.collect_all(id).await?;

        self.persister.persist(&record, &typing, &thread).await?;
        self.checkpoints.mark_complete(id).await?;

        info!(
            profile_id = %id,
            label = %record.mbti_profile,
            comments = thread.items.len(),
            partial_thread = thread.is_partial(),
            "processed profile"
        );
        Ok(ProfileOutcome::Completed {
            comments: thread.items.len(),
            partial_thread: thread.is_partial(),
        })
    }
}

/// Ids to hand to [`Harvester::run`].
///
/// The range starts at `start_id` or one past the highest checkpoint and spans
/// `num_profiles_to_scrape` ids. With `retry_failed`, ids below the start that
/// have an error entry but no checkpoint go first.
pub async fn plan_run(
    cfg: &HarvestConfig,
    checkpoints: &dyn CheckpointStore,
    errors: &dyn ErrorLog,
) -> Result<Vec<ProfileId>, StorageError> {
    let start = match cfg.start_id {
        Some(id) => ProfileId(id),
        None => checkpoints
            .highest_complete()
            .await?
            .map_or(ProfileId(1), ProfileId::next),
    };
    let count = i64::try_from(cfg.num_profiles_to_scrape).unwrap_or(i64::MAX);

    let mut ids = Vec::new();
    if cfg.retry_failed {
        let retry = errors.unresolved_below(start).await?;
        info!(count = retry.len(), "re-enqueueing previously failed profiles");
        ids.extend(retry);
    }
    let end = start.get().saturating_add(count);
    ids.extend((start.get()..end).map(ProfileId));
    info!(start = %start, count, "planned profile range");
    Ok(ids)
}
