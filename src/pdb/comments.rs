use std::sync::Arc;
use tracing::{debug, warn};

use super::models::{CommentPage, CommentThread, ProfileId};
use super::provider::Fetcher;
use super::ApiEndpoints;
use crate::error::{FetchError, HarvestError};

pub const DEFAULT_MAX_PAGES: usize = 500;

/// Walks `/comments/{id}` page by page.
///
/// Best effort: a failing page ends the walk but keeps what was already
/// collected, unlike the profile fetch which is all-or-nothing.
#[derive(Clone)]
pub struct CommentCollector {
    fetcher: Arc<dyn Fetcher>,
    endpoints: ApiEndpoints,
    max_pages: usize,
}

impl CommentCollector {
    pub fn new(fetcher: Arc<dyn Fetcher>, endpoints: ApiEndpoints, max_pages: usize) -> Self {
        Self {
            fetcher,
            endpoints,
            max_pages: max_pages.max(1),
        }
    }

    /// Every failure except a missing proxy lease ends the walk with a partial
    /// thread. Without a lease the whole profile is retried later, so the
    /// error is returned instead.
    pub async fn collect_all(&self, id: ProfileId) -> Result<CommentThread, HarvestError> {
        let mut thread = CommentThread::default();
        let mut offset = 0i64;

        loop {
            if thread.pages >= self.max_pages {
                thread.stopped_early = Some(HarvestError::schema(format!(
                    "comment thread for profile {id} exceeded {} pages",
                    self.max_pages
                )));
                break;
            }

            let url = self.endpoints.comments_url(id, offset);
            let raw = match self.fetcher.get_json(&url).await {
                Ok(raw) => raw,
                Err(err @ FetchError::ProxyUnavailable { .. }) => {
                    warn!(profile_id = %id, pages = thread.pages, "no proxy lease for comment page; abandoning profile");
                    return Err(err.into());
                }
                Err(err) => {
                    thread.stopped_early = Some(err.into());
                    break;
                }
            };
            let page: CommentPage = match serde_json::from_value(raw) {
                Ok(page) => page,
                Err(err) => {
                    thread.stopped_early = Some(HarvestError::schema(format!(
                        "malformed comment page at offset {offset}: {err}"
                    )));
                    break;
                }
            };

            thread.pages += 1;
            thread.items.extend(page.comments);
            if !page.has_more {
                break;
            }

            let next = page.next_offset.unwrap_or(0);
            if next <= offset {
                thread.stopped_early = Some(HarvestError::schema(format!(
                    "comment pager did not advance (offset {offset} -> {next})"
                )));
                break;
            }
            offset = next;
        }

        match &thread.stopped_early {
            Some(reason) => warn!(
                profile_id = %id,
                pages = thread.pages,
                comments = thread.items.len(),
                reason = %reason,
                "comment collection stopped early; keeping partial thread"
            ),
            None => debug!(profile_id = %id, pages = thread.pages, comments = thread.items.len(), "comment thread collected"),
        }
        Ok(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out canned responses in order and remembers requested URLs.
    struct Pages {
        responses: Mutex<VecDeque<Result<Value, FetchError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl Pages {
        fn new(responses: Vec<Result<Value, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Fetcher for Pages {
        async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
            self.seen.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected request {url}"))
        }
    }

    fn collector(pages: Arc<Pages>, max_pages: usize) -> CommentCollector {
        CommentCollector::new(pages, ApiEndpoints::new("http://api.test"), max_pages)
    }

    #[tokio::test]
    async fn follows_next_offset_until_exhausted() {
        let pages = Pages::new(vec![
            Ok(json!({ "items": ["a", "b"], "next_offset": 2, "has_more": true })),
            Ok(json!({ "items": ["c"], "next_offset": 3, "has_more": false })),
        ]);
        let thread = collector(pages.clone(), 10).collect_all(ProfileId(5)).await.unwrap();

        assert_eq!(thread.items, vec![json!("a"), json!("b"), json!("c")]);
        assert!(!thread.is_partial());
        let seen = pages.seen.lock().unwrap().clone();
        assert!(seen[0].contains("offset=0"));
        assert!(seen[1].contains("offset=2"));
    }

    #[tokio::test]
    async fn failed_page_keeps_earlier_items() {
        let pages = Pages::new(vec![
            Ok(json!({ "comments": [1, 2], "next_offset": 2, "has_more": true })),
            Ok(json!({ "comments": [3, 4], "next_offset": 4, "has_more": true })),
            Err(FetchError::RemoteRejected {
                url: "http://api.test/comments/5".into(),
                status: 502,
            }),
        ]);
        let thread = collector(pages, 10).collect_all(ProfileId(5)).await.unwrap();

        assert_eq!(thread.items, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(thread.pages, 2);
        assert_eq!(
            thread.stopped_early.as_ref().map(|e| e.kind()),
            Some(ErrorKind::RemoteRejected)
        );
    }

    #[tokio::test]
    async fn repeated_offset_stops_as_schema_mismatch() {
        let pages = Pages::new(vec![
            Ok(json!({ "comments": [1], "next_offset": 1, "has_more": true })),
            Ok(json!({ "comments": [2], "next_offset": 1, "has_more": true })),
        ]);
        let thread = collector(pages, 10).collect_all(ProfileId(5)).await.unwrap();

        assert_eq!(thread.items, vec![json!(1), json!(2)]);
        assert_eq!(
            thread.stopped_early.as_ref().map(|e| e.kind()),
            Some(ErrorKind::SchemaMismatch)
        );
    }

    #[tokio::test]
    async fn page_cap_bounds_endless_threads() {
        let pages = Pages::new(vec![
            Ok(json!({ "comments": [1], "next_offset": 1, "has_more": true })),
            Ok(json!({ "comments": [2], "next_offset": 2, "has_more": true })),
        ]);
        let thread = collector(pages.clone(), 2).collect_all(ProfileId(5)).await.unwrap();

        assert_eq!(thread.items.len(), 2);
        assert_eq!(pages.seen.lock().unwrap().len(), 2);
        assert!(thread
            .stopped_early
            .as_ref()
            .is_some_and(|e| e.to_string().contains("exceeded 2 pages")));
    }

    #[tokio::test]
    async fn first_page_failure_yields_empty_partial_thread() {
        let pages = Pages::new(vec![Err(FetchError::transport("http://api.test", "reset"))]);
        let thread = collector(pages, 10).collect_all(ProfileId(5)).await.unwrap();

        assert!(thread.items.is_empty());
        assert!(thread.is_partial());
    }

    #[tokio::test]
    async fn missing_proxy_lease_fails_the_profile() {
        let pages = Pages::new(vec![
            Ok(json!({ "comments": [1], "next_offset": 1, "has_more": true })),
            Err(FetchError::ProxyUnavailable {
                url: "http://api.test/comments/5".into(),
            }),
        ]);
        let err = collector(pages, 10).collect_all(ProfileId(5)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProxyUnavailable);
    }
}
