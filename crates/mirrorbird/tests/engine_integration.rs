//! End-to-end engine scenarios against a real in-memory state store with
//! fake source, sink, and downloader adapters.
//!
//! Key scenarios:
//! - lock contention short-circuits the run
//! - first-run upload, then permanent dedupe on the next run
//! - the media budget bounds selection
//! - rate limits enter cooldown without touching cursor fields, and cooled
//!   accounts make no network calls
//! - oversize videos are recorded as skips and never reach the sink

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use mirrorbird::download::{DownloadError, Downloader, LocalFile};
use mirrorbird::engine::{media_key, EngineConfig, SyncEngine};
use mirrorbird::sink::{MediaGroup, MessageId, SinkClient, SinkError};
use mirrorbird::source::{
    FetchDirection, MediaItem, MediaTimeline, Post, SessionStatus, SourceClient, SourceError,
};
use mirrorbird::state::{AccountCursor, MediaStatus, MediaType, SqliteStore, StateStore};

// ─── Fakes ─────────────────────────────────────────────────────────────────

#[derive(Default, Clone)]
struct FakeSource {
    /// Queued responses keyed by `(handle, direction)`, consumed per call.
    responses: Arc<Mutex<HashMap<(String, FetchDirection), VecDeque<Result<MediaTimeline, SourceError>>>>>,
    calls: Arc<AtomicUsize>,
}

impl FakeSource {
    fn queue(
        &self,
        handle: &str,
        direction: FetchDirection,
        response: Result<MediaTimeline, SourceError>,
    ) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((handle.to_string(), direction))
            .or_default()
            .push_back(response);
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn list_posts_with_media(
        &self,
        handle: &str,
        direction: FetchDirection,
        _cursor: Option<&str>,
        _page_limit: u32,
    ) -> Result<MediaTimeline, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&(handle.to_string(), direction))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(MediaTimeline::default()))
    }

    async fn check_session(&self) -> Result<SessionStatus, SourceError> {
        Ok(SessionStatus {
            logged_in: true,
            host: None,
            reason: None,
        })
    }

    async fn health_check(&self, _handle: &str) -> Result<(), SourceError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeSinkInner {
    texts: Vec<String>,
    groups: Vec<MediaGroup>,
}

#[derive(Default, Clone)]
struct FakeSink {
    inner: Arc<Mutex<FakeSinkInner>>,
    next_message_id: Arc<AtomicI64>,
    sends_to_fail: Arc<AtomicUsize>,
}

impl FakeSink {
    fn fail_next_sends(&self, count: usize) {
        self.sends_to_fail.store(count, Ordering::SeqCst);
    }

    fn texts(&self) -> Vec<String> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).texts.clone()
    }

    fn group_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).groups.len()
    }
}

#[async_trait]
impl SinkClient for FakeSink {
    async fn send_media_group(&self, group: &MediaGroup) -> Result<Vec<MessageId>, SinkError> {
        if self
            .sends_to_fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::api("injected send failure"));
        }
        let ids = group
            .files
            .iter()
            .map(|_| self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1)
            .collect();
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .groups
            .push(group.clone());
        Ok(ids)
    }

    async fn send_text(&self, text: &str) -> Result<(), SinkError> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .texts
            .push(text.to_string());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes a tiny marker file but reports a configurable size, so oversize
/// handling is testable without gigabyte fixtures.
#[derive(Default, Clone)]
struct FakeDownloader {
    sizes: Arc<Mutex<HashMap<String, u64>>>,
}

impl FakeDownloader {
    fn set_size(&self, url: &str, size: u64) {
        self.sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), size);
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(
        &self,
        media_key: &str,
        media_url: &str,
        media_type: MediaType,
        dir: &Path,
    ) -> Result<LocalFile, DownloadError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{media_key}{}", media_type.extension()));
        tokio::fs::write(&path, b"fake media").await?;
        let size_bytes = self
            .sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(media_url)
            .copied()
            .unwrap_or(100);
        Ok(LocalFile {
            media_key: media_key.to_string(),
            media_url: media_url.to_string(),
            media_type,
            path,
            size_bytes,
        })
    }
}

// ─── Harness ───────────────────────────────────────────────────────────────

struct Harness {
    engine: SyncEngine<SqliteStore, FakeSource, FakeSink, FakeDownloader>,
    store: SqliteStore,
    source: FakeSource,
    sink: FakeSink,
    downloader: FakeDownloader,
    scratch: tempfile::TempDir,
}

fn harness(accounts: &[&str], max_media_per_run: u32) -> Harness {
    let store = SqliteStore::in_memory().expect("in-memory store");
    let source = FakeSource::default();
    let sink = FakeSink::default();
    let downloader = FakeDownloader::default();
    let scratch = tempfile::tempdir().expect("scratch dir");

    let config = EngineConfig {
        accounts: accounts.iter().map(|s| (*s).to_string()).collect(),
        download_dir: scratch.path().to_path_buf(),
        max_media_per_run,
        max_upload_video_bytes: 1_000,
        rate_limit_cooldown_seconds: 7_200,
        ..EngineConfig::default()
    };
    let engine = SyncEngine::new(
        store.clone(),
        source.clone(),
        sink.clone(),
        downloader.clone(),
        config,
    );
    Harness {
        engine,
        store,
        source,
        sink,
        downloader,
        scratch,
    }
}

fn photo_post(id: &str, photos: usize) -> Post {
    Post {
        id: id.to_string(),
        handle: "alice".into(),
        url: format!("https://x.com/alice/status/{id}"),
        posted_at: Some(Utc::now()),
        media: (0..photos)
            .map(|i| MediaItem {
                url: format!("https://media.example/{id}/{i}.jpg"),
                media_type: MediaType::Photo,
            })
            .collect(),
    }
}

fn video_post(id: &str, url: &str) -> Post {
    Post {
        id: id.to_string(),
        handle: "alice".into(),
        url: format!("https://x.com/alice/status/{id}"),
        posted_at: Some(Utc::now()),
        media: vec![MediaItem {
            url: url.to_string(),
            media_type: MediaType::Video,
        }],
    }
}

fn timeline(posts: Vec<Post>) -> MediaTimeline {
    MediaTimeline {
        posts,
        next_cursor: None,
    }
}

fn scratch_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_skipped_when_lock_is_held() {
    let h = harness(&["alice"], 300);
    h.store.init().await.expect("init");
    assert!(h
        .store
        .acquire_lock("daily-sync", "other", 100)
        .await
        .expect("pre-acquire"));

    let report = h.engine.run().await.expect("run");

    assert!(report.skipped_by_lock);
    assert!(report.accounts.is_empty());
    assert_eq!(h.source.call_count(), 0);
}

#[tokio::test]
async fn first_run_uploads_and_advances_cursor() {
    let h = harness(&["alice"], 300);
    h.source.queue(
        "alice",
        FetchDirection::Newer,
        Ok(timeline(vec![photo_post("1", 1)])),
    );

    let report = h.engine.run().await.expect("run");

    assert!(!report.skipped_by_lock);
    let summary = &report.accounts[0];
    assert_eq!((summary.uploaded, summary.skipped, summary.failed), (1, 0, 0));

    let key = media_key("1", "https://media.example/1/0.jpg");
    assert!(h.store.is_media_uploaded(&key).await.expect("lookup"));

    let cursor = h.store.get_account("alice").await.expect("cursor");
    assert_eq!(cursor.latest_seen_post_id.as_deref(), Some("1"));
    assert!(cursor.backfill_done, "no continuation means backfill is done");
    assert!(cursor.rate_limited_until.is_none());

    assert_eq!(h.sink.group_count(), 1);
    assert_eq!(h.sink.texts().len(), 1, "one aggregated report");
    assert!(
        scratch_files(h.scratch.path()).is_empty(),
        "staged files are removed after the post"
    );
}

#[tokio::test]
async fn second_run_dedupes_everything() {
    let h = harness(&["alice"], 300);
    for _ in 0..2 {
        h.source.queue(
            "alice",
            FetchDirection::Newer,
            Ok(timeline(vec![photo_post("1", 1)])),
        );
    }

    let first = h.engine.run().await.expect("first run");
    assert_eq!(first.accounts[0].uploaded, 1);

    // Pretend the cursor never advanced so the same post is offered again:
    // the registry alone must prevent a re-upload.
    let mut cursor = h.store.get_account("alice").await.expect("cursor");
    cursor.latest_seen_post_id = None;
    cursor.updated_at = None;
    h.store.put_account(cursor).await.expect("rewind cursor");

    let second = h.engine.run().await.expect("second run");
    let summary = &second.accounts[0];
    assert_eq!((summary.uploaded, summary.skipped), (0, 1));
    assert_eq!(h.sink.group_count(), 1, "no second sink delivery");
}

#[tokio::test]
async fn idempotent_when_source_has_nothing_new() {
    let h = harness(&["alice"], 300);
    h.source.queue(
        "alice",
        FetchDirection::Newer,
        Ok(timeline(vec![photo_post("1", 1)])),
    );

    h.engine.run().await.expect("first run");
    // Second run: the fake returns empty timelines.
    let report = h.engine.run().await.expect("second run");

    assert_eq!(report.accounts[0].uploaded, 0);
    assert_eq!(h.sink.group_count(), 1);
}

#[tokio::test]
async fn budget_bounds_selection() {
    let h = harness(&["alice"], 3);
    h.source.queue(
        "alice",
        FetchDirection::Newer,
        Ok(timeline(vec![
            photo_post("3", 2),
            photo_post("2", 2),
            photo_post("1", 2),
        ])),
    );

    let report = h.engine.run().await.expect("run");

    let summary = &report.accounts[0];
    assert!(summary.uploaded <= 3);
    assert_eq!(summary.incremental_candidates, 3);
    assert_eq!(
        summary.incremental_selected, 1,
        "two media fit the budget of three, the rest exceed the remainder"
    );
    assert_eq!(summary.uploaded, 2);
}

#[tokio::test]
async fn rate_limit_enters_cooldown_and_preserves_cursor() {
    let h = harness(&["alice"], 300);
    h.store.init().await.expect("init");
    h.store
        .put_account(AccountCursor {
            handle: "alice".into(),
            latest_seen_post_id: Some("7".into()),
            backfill_cursor: Some("bottom-7".into()),
            backfill_done: false,
            rate_limited_until: None,
            updated_at: None,
        })
        .await
        .expect("seed cursor");

    h.source.queue(
        "alice",
        FetchDirection::Newer,
        Err(SourceError::RateLimited {
            hosts: vec!["https://x.com/i/api".into(), "https://twitter.com/i/api".into()],
        }),
    );

    let before = Utc::now();
    let report = h.engine.run().await.expect("run");

    let summary = &report.accounts[0];
    assert!(summary.cooldown_active);
    assert_eq!(summary.failed, 1);
    let until = summary.cooldown_until.expect("cooldown deadline");
    let seconds = (until - before).num_seconds();
    assert!((7_100..=7_300).contains(&seconds), "≈ now + cooldown, got {seconds}");

    let cursor = h.store.get_account("alice").await.expect("cursor");
    assert_eq!(cursor.latest_seen_post_id.as_deref(), Some("7"));
    assert_eq!(cursor.backfill_cursor.as_deref(), Some("bottom-7"));
    assert!(!cursor.backfill_done);
    assert_eq!(cursor.rate_limited_until, Some(until));

    // Cooldown is expected operation: only the aggregated report goes out.
    assert_eq!(h.sink.texts().len(), 1);
}

#[tokio::test]
async fn cooled_down_account_makes_no_network_calls() {
    let h = harness(&["alice"], 300);
    h.store.init().await.expect("init");
    h.store
        .put_account(AccountCursor {
            handle: "alice".into(),
            latest_seen_post_id: Some("7".into()),
            backfill_cursor: None,
            backfill_done: true,
            rate_limited_until: Some(Utc::now() + chrono::Duration::hours(1)),
            updated_at: None,
        })
        .await
        .expect("seed cooldown");

    let report = h.engine.run().await.expect("run");

    let summary = &report.accounts[0];
    assert!(summary.cooldown_active);
    assert_eq!(summary.failed, 0);
    assert_eq!(h.source.call_count(), 0, "cooldown skips all source calls");
}

#[tokio::test]
async fn oversize_video_is_recorded_and_never_sent() {
    let h = harness(&["alice"], 300);
    let url = "https://media.example/big/video.mp4";
    h.downloader.set_size(url, 1_001); // cap is 1_000 in the harness
    h.source.queue(
        "alice",
        FetchDirection::Newer,
        Ok(timeline(vec![video_post("9", url)])),
    );

    let report = h.engine.run().await.expect("run");

    let summary = &report.accounts[0];
    assert_eq!((summary.uploaded, summary.skipped, summary.failed), (0, 1, 0));

    let key = media_key("9", url);
    let record = h
        .store
        .get_media(&key)
        .await
        .expect("lookup")
        .expect("oversize skip is recorded in the registry");
    assert_eq!(record.status, MediaStatus::SkippedOversize);
    assert!(record.sink_message_ids.is_empty());
    assert_eq!(h.sink.group_count(), 0, "nothing reaches the sink");
    assert!(scratch_files(h.scratch.path()).is_empty(), "file deleted");
}

#[tokio::test(start_paused = true)]
async fn exhausted_sink_retries_fail_the_post_but_clean_up() {
    let h = harness(&["alice"], 300);
    h.sink.fail_next_sends(3); // first attempt + two retries
    h.source.queue(
        "alice",
        FetchDirection::Newer,
        Ok(timeline(vec![photo_post("4", 2)])),
    );

    let report = h.engine.run().await.expect("run");

    let summary = &report.accounts[0];
    assert_eq!((summary.uploaded, summary.failed), (0, 1));

    // No registry rows for the failed post.
    let key = media_key("4", "https://media.example/4/0.jpg");
    assert!(!h.store.is_media_uploaded(&key).await.expect("lookup"));
    assert!(scratch_files(h.scratch.path()).is_empty(), "files cleaned up");

    // The cursor still advanced: the account itself completed.
    let cursor = h.store.get_account("alice").await.expect("cursor");
    assert_eq!(cursor.latest_seen_post_id.as_deref(), Some("4"));
}

#[tokio::test]
async fn generic_source_failure_sends_report_and_keeps_cursor() {
    let h = harness(&["alice"], 300);
    h.store.init().await.expect("init");
    h.store
        .put_account(AccountCursor {
            handle: "alice".into(),
            latest_seen_post_id: Some("5".into()),
            backfill_cursor: Some("bottom-5".into()),
            backfill_done: false,
            rate_limited_until: None,
            updated_at: None,
        })
        .await
        .expect("seed cursor");
    h.source.queue(
        "alice",
        FetchDirection::Newer,
        Err(SourceError::api("status 500: upstream exploded")),
    );

    let report = h.engine.run().await.expect("run");

    assert_eq!(report.accounts[0].failed, 1);
    assert!(!report.accounts[0].cooldown_active);

    let cursor = h.store.get_account("alice").await.expect("cursor");
    assert_eq!(cursor.latest_seen_post_id.as_deref(), Some("5"));
    assert_eq!(cursor.backfill_cursor.as_deref(), Some("bottom-5"));
    assert!(cursor.rate_limited_until.is_none());

    let texts = h.sink.texts();
    assert_eq!(texts.len(), 2, "failure notice plus aggregated report");
    assert!(texts[0].contains("Sync failed for @alice"));
}

#[tokio::test]
async fn empty_account_list_still_reports() {
    let h = harness(&[], 300);

    let report = h.engine.run().await.expect("run");

    assert!(report.accounts.is_empty());
    assert!(!report.skipped_by_lock);
    assert_eq!(h.sink.texts().len(), 1);
}

#[tokio::test]
async fn no_new_posts_leaves_cursor_values_in_place() {
    let h = harness(&["alice"], 300);
    h.store.init().await.expect("init");
    h.store
        .put_account(AccountCursor {
            handle: "alice".into(),
            latest_seen_post_id: Some("5".into()),
            backfill_cursor: None,
            backfill_done: true,
            rate_limited_until: Some(Utc::now() - chrono::Duration::hours(1)),
            updated_at: None,
        })
        .await
        .expect("seed cursor");
    // Expired cooldown, empty timelines: the run clears the cooldown field
    // and leaves everything else as it was.

    let report = h.engine.run().await.expect("run");

    assert_eq!(report.accounts[0].uploaded, 0);
    let cursor = h.store.get_account("alice").await.expect("cursor");
    assert_eq!(cursor.latest_seen_post_id.as_deref(), Some("5"));
    assert!(cursor.backfill_done);
    assert!(cursor.rate_limited_until.is_none(), "cooldown cleared");
}

#[tokio::test]
async fn backfill_done_skips_older_fetches_forever() {
    let h = harness(&["alice"], 300);
    h.store.init().await.expect("init");
    h.store
        .put_account(AccountCursor {
            handle: "alice".into(),
            latest_seen_post_id: None,
            backfill_cursor: Some("stale".into()),
            backfill_done: true,
            rate_limited_until: None,
            updated_at: None,
        })
        .await
        .expect("seed cursor");

    h.engine.run().await.expect("run");

    // Only the newer-direction fetch went out.
    assert_eq!(h.source.call_count(), 1);
    let cursor = h.store.get_account("alice").await.expect("cursor");
    assert!(cursor.backfill_done, "terminal flag never regresses");
}

#[tokio::test]
async fn incremental_stops_at_latest_seen_post() {
    let h = harness(&["alice"], 300);
    h.store.init().await.expect("init");
    h.store
        .put_account(AccountCursor {
            handle: "alice".into(),
            latest_seen_post_id: Some("2".into()),
            backfill_cursor: None,
            backfill_done: true,
            rate_limited_until: None,
            updated_at: None,
        })
        .await
        .expect("seed cursor");

    // Newest-first response; iteration must stop at the seen id "2".
    h.source.queue(
        "alice",
        FetchDirection::Newer,
        Ok(timeline(vec![
            photo_post("4", 1),
            photo_post("3", 1),
            photo_post("2", 1),
            photo_post("1", 1),
        ])),
    );

    let report = h.engine.run().await.expect("run");

    let summary = &report.accounts[0];
    assert_eq!(summary.incremental_candidates, 2, "only posts newer than the cursor");
    assert_eq!(summary.uploaded, 2);

    let cursor = h.store.get_account("alice").await.expect("cursor");
    assert_eq!(cursor.latest_seen_post_id.as_deref(), Some("4"));
}

#[tokio::test]
async fn backfill_candidates_merge_behind_incremental() {
    let h = harness(&["alice"], 300);
    h.source.queue(
        "alice",
        FetchDirection::Newer,
        Ok(timeline(vec![photo_post("10", 1)])),
    );
    h.source.queue(
        "alice",
        FetchDirection::Older,
        Ok(MediaTimeline {
            posts: vec![photo_post("2", 1), photo_post("1", 1)],
            next_cursor: Some("bottom-1".into()),
        }),
    );

    let report = h.engine.run().await.expect("run");

    let summary = &report.accounts[0];
    assert_eq!(summary.incremental_candidates, 1);
    assert_eq!(summary.backfill_candidates, 2);
    assert_eq!(summary.uploaded, 3);
    assert!(!summary.backfill_done);

    let cursor = h.store.get_account("alice").await.expect("cursor");
    assert_eq!(cursor.backfill_cursor.as_deref(), Some("bottom-1"));
    assert!(!cursor.backfill_done);
}
