use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jmir_adapters::{IssueNormalizer, PageFetcher};
use jmir_core::{IssueQuery, RemoteIssue};
use jmir_storage::{content_fingerprint, FetchError, IssueStore, LivenessPing};
use jmir_sync::{PassOptions, SyncErrorKind, SyncPipeline};
use serde_json::json;
use tempfile::{tempdir, TempDir};

type ScriptedPage = Result<Vec<RemoteIssue>, FetchError>;

/// Serves pre-baked pages in order and records the offsets it was asked for.
struct ScriptedFetcher {
    pages: Mutex<VecDeque<ScriptedPage>>,
    offsets: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedFetcher {
    fn new(pages: Vec<ScriptedPage>) -> (Self, Arc<Mutex<Vec<usize>>>) {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                pages: Mutex::new(pages.into()),
                offsets: Arc::clone(&offsets),
            },
            offsets,
        )
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch_page(
        &self,
        _query: &IssueQuery,
        start_at: usize,
        _max_results: usize,
    ) -> Result<Vec<RemoteIssue>, FetchError> {
        self.offsets.lock().unwrap().push(start_at);
        self.pages.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

fn issue(n: usize, summary: &str) -> RemoteIssue {
    let assignee = if n % 2 == 0 {
        json!(null)
    } else {
        json!({"displayName": "Ada Byron", "accountId": "acc-1"})
    };
    serde_json::from_value(json!({
        "id": (10_000 + n).to_string(),
        "key": format!("BSUP-{n}"),
        "fields": {
            "assignee": assignee,
            "created": "2026-02-10T09:00:00.000+0000",
            "updated": "2026-02-11T09:00:00.000+0000",
            "issuetype": {"id": "10004", "name": "Task"},
            "status": {"name": "Open"},
            "project": {"key": "BSUP"},
            "summary": summary,
            "labels": [],
            "worklog": {"worklogs": []}
        }
    }))
    .expect("issue fixture")
}

fn page(range: std::ops::Range<usize>) -> ScriptedPage {
    Ok(range.map(|n| issue(n, "initial summary")).collect())
}

fn options(page_size: usize) -> PassOptions {
    PassOptions {
        project: "BSUP".to_string(),
        window_days: 30,
        page_size,
    }
}

async fn fresh_store() -> (TempDir, IssueStore) {
    let dir = tempdir().expect("tempdir");
    let store = IssueStore::connect(dir.path().join("mirror.db"))
        .await
        .expect("connect");
    (dir, store)
}

fn pipeline(
    store: &IssueStore,
    pages: Vec<ScriptedPage>,
    page_size: usize,
) -> (SyncPipeline, Arc<Mutex<Vec<usize>>>) {
    let (fetcher, offsets) = ScriptedFetcher::new(pages);
    (
        SyncPipeline::new(store.clone(), Box::new(fetcher), options(page_size)),
        offsets,
    )
}

#[tokio::test]
async fn pagination_stops_after_short_page() {
    let (_dir, store) = fresh_store().await;
    let (sync, offsets) = pipeline(&store, vec![page(0..100), page(100..200), page(200..247)], 100);

    let summary = sync.run_once().await.expect("pass");

    assert_eq!(*offsets.lock().unwrap(), vec![0, 100, 200]);
    assert_eq!(summary.counts.pages_fetched, 3);
    assert_eq!(summary.counts.inserted, 247);
    assert_eq!(store.count_issues().await.expect("count"), 247);
}

#[tokio::test]
async fn exact_multiple_of_page_size_ends_on_empty_page() {
    let (_dir, store) = fresh_store().await;
    let (sync, offsets) = pipeline(&store, vec![page(0..10), Ok(Vec::new())], 10);

    let summary = sync.run_once().await.expect("pass");

    assert_eq!(*offsets.lock().unwrap(), vec![0, 10]);
    assert_eq!(summary.counts.inserted, 10);
}

#[tokio::test]
async fn second_identical_pass_writes_nothing() {
    let (_dir, store) = fresh_store().await;

    let (first, _) = pipeline(&store, vec![page(0..5)], 100);
    let summary = first.run_once().await.expect("first pass");
    assert_eq!(summary.counts.inserted, 5);

    let (second, _) = pipeline(&store, vec![page(0..5)], 100);
    let summary = second.run_once().await.expect("second pass");
    assert_eq!(summary.counts.inserted, 0);
    assert_eq!(summary.counts.updated, 0);
    assert_eq!(summary.counts.skipped, 5);
    assert_eq!(store.count_issues().await.expect("count"), 5);
}

#[tokio::test]
async fn changed_content_updates_the_single_row() {
    let (_dir, store) = fresh_store().await;

    let (first, _) = pipeline(&store, vec![page(1..4)], 100);
    first.run_once().await.expect("first pass");
    let before = store.get_issue("BSUP-2").await.expect("get").expect("row");

    let changed = issue(2, "summary edited upstream");
    let (second, _) = pipeline(
        &store,
        vec![Ok(vec![issue(1, "initial summary"), changed.clone(), issue(3, "initial summary")])],
        100,
    );
    let summary = second.run_once().await.expect("second pass");

    assert_eq!(summary.counts.updated, 1);
    assert_eq!(summary.counts.skipped, 2);
    assert_eq!(summary.counts.inserted, 0);
    assert_eq!(store.count_rows_for_key("BSUP-2").await.expect("count"), 1);

    let after = store.get_issue("BSUP-2").await.expect("get").expect("row");
    let expected = IssueNormalizer::default().normalize(&changed).expect("normalize");
    assert_ne!(after.fingerprint, before.fingerprint);
    assert_eq!(after.fingerprint, content_fingerprint(&expected));
    assert_eq!(after.record.summary.as_deref(), Some("summary edited upstream"));
}

#[tokio::test]
async fn duplicate_key_within_one_pass_keeps_one_row() {
    let (_dir, store) = fresh_store().await;
    let (sync, _) = pipeline(
        &store,
        vec![Ok(vec![issue(7, "first sighting"), issue(7, "moved between pages")])],
        100,
    );

    let summary = sync.run_once().await.expect("pass");

    assert_eq!(summary.counts.inserted, 1);
    assert_eq!(summary.counts.updated, 1);
    assert_eq!(store.count_rows_for_key("BSUP-7").await.expect("count"), 1);
}

#[tokio::test]
async fn failed_third_page_rolls_back_whole_pass() {
    let (_dir, store) = fresh_store().await;
    let (sync, offsets) = pipeline(
        &store,
        vec![
            page(0..100),
            page(100..200),
            Err(FetchError::HttpStatus {
                status: 503,
                url: "https://example.atlassian.net/rest/api/2/search".to_string(),
            }),
        ],
        100,
    );

    let err = sync.run_once().await.unwrap_err();

    assert_eq!(err.kind(), SyncErrorKind::Fetch);
    assert_eq!(offsets.lock().unwrap().len(), 3);
    assert_eq!(store.count_issues().await.expect("count"), 0);
}

#[tokio::test]
async fn clamped_page_size_aborts_instead_of_committing_a_partial_pass() {
    let (_dir, store) = fresh_store().await;
    let (sync, offsets) = pipeline(
        &store,
        vec![Err(FetchError::PageSizeClamped {
            requested: 500,
            granted: 100,
        })],
        500,
    );

    let err = sync.run_once().await.unwrap_err();

    assert_eq!(err.kind(), SyncErrorKind::Fetch);
    assert_eq!(*offsets.lock().unwrap(), vec![0]);
    assert_eq!(store.count_issues().await.expect("count"), 0);
}

#[tokio::test]
async fn rollback_preserves_rows_from_earlier_passes() {
    let (_dir, store) = fresh_store().await;
    let (first, _) = pipeline(&store, vec![page(0..3)], 100);
    first.run_once().await.expect("first pass");

    let (second, _) = pipeline(
        &store,
        vec![
            Ok((0..3).map(|n| issue(n, "rewritten")).chain((3..5).map(|n| issue(n, "new"))).collect()),
            Err(FetchError::RateLimited {
                url: "https://example.atlassian.net/rest/api/2/search".to_string(),
                retry_after: Some("30".to_string()),
            }),
        ],
        5,
    );
    assert!(second.run_once().await.is_err());

    assert_eq!(store.count_issues().await.expect("count"), 3);
    let kept = store.get_issue("BSUP-1").await.expect("get").expect("row");
    assert_eq!(kept.record.summary.as_deref(), Some("initial summary"));
}

#[tokio::test]
async fn issue_without_key_aborts_as_validation_error() {
    let (_dir, store) = fresh_store().await;
    let keyless: RemoteIssue = serde_json::from_value(json!({"id": "1", "fields": {"summary": "no key"}}))
        .expect("fixture");
    let (sync, _) = pipeline(&store, vec![page(0..2), Ok(vec![keyless])], 2);

    let err = sync.run_once().await.unwrap_err();

    assert_eq!(err.kind(), SyncErrorKind::Validation);
    assert_eq!(store.count_issues().await.expect("count"), 0);
}

#[tokio::test]
async fn absent_assignee_is_stored_as_null() {
    let (_dir, store) = fresh_store().await;
    let (sync, _) = pipeline(&store, vec![page(0..2)], 100);
    sync.run_once().await.expect("pass");

    let unassigned = store.get_issue("BSUP-0").await.expect("get").expect("row");
    assert_eq!(unassigned.record.assignee, None);
    assert_eq!(unassigned.record.assignee_id, None);

    let assigned = store.get_issue("BSUP-1").await.expect("get").expect("row");
    assert_eq!(assigned.record.assignee.as_deref(), Some("Ada Byron"));
}

#[tokio::test]
async fn empty_project_fails_before_any_fetch() {
    let (_dir, store) = fresh_store().await;
    let (fetcher, offsets) = ScriptedFetcher::new(vec![page(0..1)]);
    let sync = SyncPipeline::new(
        store.clone(),
        Box::new(fetcher),
        PassOptions {
            project: "  ".to_string(),
            window_days: 30,
            page_size: 100,
        },
    );

    let err = sync.run_once().await.unwrap_err();

    assert_eq!(err.kind(), SyncErrorKind::Validation);
    assert!(offsets.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_health_check_does_not_fail_pass() {
    let (_dir, store) = fresh_store().await;
    let (sync, _) = pipeline(&store, vec![page(0..1)], 100);
    let sync = sync.with_liveness(Some(
        LivenessPing::new("http://127.0.0.1:9/ping").expect("client"),
    ));

    let summary = sync.run_once().await.expect("pass");
    assert_eq!(summary.counts.inserted, 1);
}
