use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use profile_harvest::config::HarvestConfig;
use profile_harvest::database_ops::archive::{ProfileArchive, RecordPersister, RecordSink};
use profile_harvest::database_ops::checkpoint::CheckpointStore;
use profile_harvest::database_ops::db::Db;
use profile_harvest::database_ops::documents::DocumentDir;
use profile_harvest::database_ops::error_log::ErrorLog;
use profile_harvest::error::{ErrorKind, FetchError, StorageError};
use profile_harvest::orchestrator::{plan_run, HarvestParts, Harvester, ProfileOutcome};
use profile_harvest::pdb::models::{ProfileId, ProfileRecord, TypingBreakdown};
use profile_harvest::pdb::provider::Fetcher;
use profile_harvest::pdb::ApiEndpoints;

const BASE: &str = "http://pdb.test/api/v1";

/// In-memory stand-in for the remote API.
#[derive(Default)]
struct FakeRemote {
    /// Status to answer `/profile/{id}` with instead of a payload.
    rejected: Mutex<HashMap<i64, u16>>,
    /// Ids whose profile request panics.
    panicking: Vec<i64>,
    /// Ids whose comment thread breaks after the first page.
    flaky_comments: Vec<i64>,
    /// Ids whose comment requests find no proxy lease.
    proxy_down_comments: Vec<i64>,
    /// Latency added to every profile request.
    profile_delay: Duration,
    profile_calls: Mutex<HashMap<i64, usize>>,
    total_calls: Mutex<usize>,
}

impl FakeRemote {
    fn reject(&self, id: i64, status: u16) {
        self.rejected.lock().unwrap().insert(id, status);
    }

    fn profile_calls(&self, id: i64) -> usize {
        self.profile_calls.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        *self.total_calls.lock().unwrap()
    }
}

fn profile_payload(id: i64) -> Value {
    json!({
        "id": id,
        "mbti_profile": format!("Person {id}"),
        "wiki_description": "",
        "subcat_link_info": { "sub_cat_id": 4, "cat_id": 1, "property_id": 1 },
        "total_vote_counts": 12,
        "functions": [],
        "systems": [],
        "breakdown_systems": { "1": [{ "personality_type": "INFP", "theCount": 12 }] },
        "breakdown_config": {},
        "mbti_letter_stats": []
    })
}

fn id_after(url: &str, marker: &str) -> i64 {
    let rest = &url[url.find(marker).unwrap() + marker.len()..];
    rest.split(['?', '&']).next().unwrap().parse().unwrap()
}

#[async_trait]
impl Fetcher for FakeRemote {
    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        *self.total_calls.lock().unwrap() += 1;
        if url.contains("/profile/") {
            let id = id_after(url, "/profile/");
            *self.profile_calls.lock().unwrap().entry(id).or_default() += 1;
            if !self.profile_delay.is_zero() {
                tokio::time::sleep(self.profile_delay).await;
            }
            if self.panicking.contains(&id) {
                panic!("fake remote blew up on {id}");
            }
            if let Some(status) = self.rejected.lock().unwrap().get(&id) {
                return Err(FetchError::RemoteRejected {
                    url: url.to_string(),
                    status: *status,
                });
            }
            return Ok(profile_payload(id));
        }

        let id = id_after(url, "/comments/");
        let offset = id_after(url, "offset=");
        if self.proxy_down_comments.contains(&id) {
            return Err(FetchError::ProxyUnavailable {
                url: url.to_string(),
            });
        }
        match (offset, self.flaky_comments.contains(&id)) {
            (0, true) => Ok(json!({ "comments": [{ "id": 1 }, { "id": 2 }], "next_offset": 2, "has_more": true })),
            (_, true) => Err(FetchError::transport(url, "connection reset")),
            _ => Ok(json!({ "comments": [{ "id": 1, "text": "hello" }], "has_more": false })),
        }
    }
}

/// Archive wrapper whose typing write can be made to fail.
struct FlakySink {
    inner: ProfileArchive,
    fail_typing: AtomicBool,
}

#[async_trait]
impl RecordSink for FlakySink {
    async fn write_profile(&self, record: &ProfileRecord) -> Result<(), StorageError> {
        self.inner.write_profile(record).await
    }

    async fn write_typing(&self, id: ProfileId, typing: &TypingBreakdown) -> Result<(), StorageError> {
        if self.fail_typing.load(Ordering::SeqCst) {
            return Err(StorageError::io(
                self.inner.documents().typing_path(id),
                std::io::Error::other("disk full"),
            ));
        }
        self.inner.write_typing(id, typing).await
    }

    async fn write_comments(&self, id: ProfileId, comments: &[Value]) -> Result<(), StorageError> {
        self.inner.write_comments(id, comments).await
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    db: Db,
    docs: DocumentDir,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::connect(&dir.path().join("harvest.db"), 4).await.unwrap();
    let docs = DocumentDir::new(dir.path().join("data"));
    Fixture { _dir: dir, db, docs }
}

fn harvester(fx: &Fixture, remote: Arc<FakeRemote>, sink: Arc<dyn RecordSink>, workers: usize) -> Harvester {
    let db = Arc::new(fx.db.clone());
    Harvester::new(
        HarvestParts {
            fetcher: remote,
            checkpoints: db.clone(),
            errors: db,
            persister: RecordPersister::new(sink),
        },
        ApiEndpoints::new(BASE),
        workers,
        10,
    )
}

fn archive(fx: &Fixture) -> Arc<dyn RecordSink> {
    Arc::new(ProfileArchive::new(fx.db.clone(), fx.docs.clone()))
}

async fn error_message(db: &Db, id: i64) -> Option<String> {
    sqlx::query_scalar("SELECT error_message FROM errors WHERE id = ?1")
        .bind(id)
        .fetch_optional(&db.pool)
        .await
        .unwrap()
}

fn ids(raw: &[i64]) -> Vec<ProfileId> {
    raw.iter().copied().map(ProfileId).collect()
}

#[tokio::test]
async fn checkpointed_ids_are_skipped_without_any_request() {
    let fx = fixture().await;
    fx.db.mark_complete(ProfileId(5)).await.unwrap();
    let remote = Arc::new(FakeRemote::default());

    let summary = harvester(&fx, remote.clone(), archive(&fx), 2)
        .run(ids(&[5]), CancellationToken::new())
        .await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(remote.total_calls(), 0);
}

#[tokio::test]
async fn rejected_profile_is_logged_and_neighbours_complete() {
    let fx = fixture().await;
    let remote = Arc::new(FakeRemote::default());
    remote.reject(101, 404);

    let summary = harvester(&fx, remote.clone(), archive(&fx), 3)
        .run(ids(&[100, 101, 102]), CancellationToken::new())
        .await;

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures.get(&ErrorKind::RemoteRejected), Some(&1));

    assert!(fx.db.is_complete(ProfileId(100)).await.unwrap());
    assert!(!fx.db.is_complete(ProfileId(101)).await.unwrap());
    assert!(fx.db.is_complete(ProfileId(102)).await.unwrap());

    let message = error_message(&fx.db, 101).await.unwrap();
    assert!(message.starts_with("RemoteRejected"), "{message}");
    assert!(message.contains("404"), "{message}");
    assert_eq!(ErrorLog::count(&fx.db).await.unwrap(), 1);

    assert!(fx.docs.typing_path(ProfileId(100)).exists());
    assert!(fx.docs.comments_path(ProfileId(102)).exists());
}

#[tokio::test]
async fn failed_typing_write_leaves_no_checkpoint_and_rerun_rewrites_everything() {
    let fx = fixture().await;
    let remote = Arc::new(FakeRemote::default());
    let sink = Arc::new(FlakySink {
        inner: ProfileArchive::new(fx.db.clone(), fx.docs.clone()),
        fail_typing: AtomicBool::new(true),
    });
    let h = harvester(&fx, remote.clone(), sink.clone(), 1);

    let outcome = h.process(ProfileId(7)).await;
    assert_eq!(outcome, ProfileOutcome::Failed(ErrorKind::StorageFailure));
    assert!(!fx.db.is_complete(ProfileId(7)).await.unwrap());
    assert!(!fx.docs.comments_path(ProfileId(7)).exists());
    assert!(error_message(&fx.db, 7).await.unwrap().starts_with("StorageFailure"));

    sink.fail_typing.store(false, Ordering::SeqCst);
    let outcome = h.process(ProfileId(7)).await;
    assert!(matches!(outcome, ProfileOutcome::Completed { comments: 1, partial_thread: false }));
    assert!(fx.db.is_complete(ProfileId(7)).await.unwrap());
    assert!(fx.docs.typing_path(ProfileId(7)).exists());
    assert!(fx.docs.comments_path(ProfileId(7)).exists());
    assert_eq!(remote.profile_calls(7), 2);
}

#[tokio::test]
async fn repeated_failures_keep_one_entry_with_latest_message() {
    let fx = fixture().await;
    let remote = Arc::new(FakeRemote::default());
    let h = harvester(&fx, remote.clone(), archive(&fx), 1);

    remote.reject(8, 404);
    h.process(ProfileId(8)).await;
    remote.reject(8, 503);
    h.process(ProfileId(8)).await;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM errors WHERE id = 8")
        .fetch_one(&fx.db.pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert!(error_message(&fx.db, 8).await.unwrap().contains("503"));
}

#[tokio::test]
async fn duplicate_ids_are_dispatched_once() {
    let fx = fixture().await;
    let remote = Arc::new(FakeRemote::default());

    let summary = harvester(&fx, remote.clone(), archive(&fx), 4)
        .run(ids(&[3, 3, 4, 3, 4]), CancellationToken::new())
        .await;

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(remote.profile_calls(3), 1);
    assert_eq!(remote.profile_calls(4), 1);
}

#[tokio::test]
async fn broken_comment_thread_still_checkpoints_partial_items() {
    let fx = fixture().await;
    let remote = Arc::new(FakeRemote {
        flaky_comments: vec![20],
        ..FakeRemote::default()
    });

    let outcome = harvester(&fx, remote, archive(&fx), 1).process(ProfileId(20)).await;

    assert_eq!(
        outcome,
        ProfileOutcome::Completed {
            comments: 2,
            partial_thread: true
        }
    );
    assert!(fx.db.is_complete(ProfileId(20)).await.unwrap());
    let stored: Value =
        serde_json::from_slice(&std::fs::read(fx.docs.comments_path(ProfileId(20))).unwrap()).unwrap();
    assert_eq!(stored, json!([{ "id": 1 }, { "id": 2 }]));
}

#[tokio::test]
async fn panicking_worker_is_isolated() {
    let fx = fixture().await;
    let remote = Arc::new(FakeRemote {
        panicking: vec![9],
        ..FakeRemote::default()
    });

    let summary = harvester(&fx, remote, archive(&fx), 2)
        .run(ids(&[8, 9, 10]), CancellationToken::new())
        .await;

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failures.get(&ErrorKind::WorkerPanic), Some(&1));
    assert!(!fx.db.is_complete(ProfileId(9)).await.unwrap());
    assert!(error_message(&fx.db, 9).await.unwrap().starts_with("WorkerPanic"));
}

#[tokio::test]
async fn cancelled_run_dispatches_nothing_new() {
    let fx = fixture().await;
    let remote = Arc::new(FakeRemote::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = harvester(&fx, remote.clone(), archive(&fx), 2)
        .run(ids(&[1, 2, 3]), cancel)
        .await;

    assert!(summary.cancelled);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(remote.total_calls(), 0);
}

#[tokio::test]
async fn stop_mid_run_drains_in_flight_ids_only() {
    let fx = fixture().await;
    let remote = Arc::new(FakeRemote {
        profile_delay: Duration::from_millis(300),
        ..FakeRemote::default()
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let summary = harvester(&fx, remote.clone(), archive(&fx), 2)
        .run((1..=10).map(ProfileId), cancel)
        .await;

    assert!(summary.cancelled);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.completed, 2);
    assert!(fx.db.is_complete(ProfileId(1)).await.unwrap());
    assert!(fx.db.is_complete(ProfileId(2)).await.unwrap());
    assert_eq!(fx.db.count_complete().await.unwrap(), 2);
    assert_eq!(ErrorLog::count(&fx.db).await.unwrap(), 0);
    for id in 3..=10 {
        assert_eq!(remote.profile_calls(id), 0, "id {id} was dispatched after the stop");
    }
}

#[tokio::test]
async fn missing_proxy_for_comments_fails_without_checkpoint() {
    let fx = fixture().await;
    let remote = Arc::new(FakeRemote {
        proxy_down_comments: vec![30],
        ..FakeRemote::default()
    });

    let summary = harvester(&fx, remote, archive(&fx), 1)
        .run(ids(&[30]), CancellationToken::new())
        .await;

    assert_eq!(summary.failures.get(&ErrorKind::ProxyUnavailable), Some(&1));
    assert!(!fx.db.is_complete(ProfileId(30)).await.unwrap());
    assert!(!fx.docs.comments_path(ProfileId(30)).exists());
    assert_eq!(ErrorLog::count(&fx.db).await.unwrap(), 1);
    assert!(error_message(&fx.db, 30).await.unwrap().starts_with("ProxyUnavailable"));
}

#[tokio::test]
async fn plan_resumes_after_highest_checkpoint_and_retries_failures() {
    let fx = fixture().await;
    for id in [1, 2, 3, 10] {
        fx.db.mark_complete(ProfileId(id)).await.unwrap();
    }
    fx.db.record(ProfileId(2), "TransportFailure: old").await.unwrap();
    fx.db.record(ProfileId(4), "RemoteRejected: HTTP 500").await.unwrap();

    let mut cfg = HarvestConfig {
        num_profiles_to_scrape: 3,
        ..HarvestConfig::default()
    };
    let planned = plan_run(&cfg, &fx.db, &fx.db).await.unwrap();
    assert_eq!(planned, ids(&[11, 12, 13]));

    cfg.retry_failed = true;
    let planned = plan_run(&cfg, &fx.db, &fx.db).await.unwrap();
    assert_eq!(planned, ids(&[4, 11, 12, 13]));

    cfg.start_id = Some(50);
    cfg.retry_failed = false;
    let planned = plan_run(&cfg, &fx.db, &fx.db).await.unwrap();
    assert_eq!(planned, ids(&[50, 51, 52]));
}

#[tokio::test]
async fn empty_store_plans_from_one() {
    let fx = fixture().await;
    let cfg = HarvestConfig {
        num_profiles_to_scrape: 2,
        ..HarvestConfig::default()
    };
    assert_eq!(plan_run(&cfg, &fx.db, &fx.db).await.unwrap(), ids(&[1, 2]));
}
