//! The sync engine: one run per invocation, accounts processed strictly in
//! configured order under the durable job lock.
//!
//! Per account the engine merges an incremental (newer-direction) fetch with
//! a backfill (older-direction) fetch, bounds the work by the global media
//! budget, stages media through the downloader, delivers post-sized groups
//! to the sink, and persists the cursor only on the account's success path.
//! Rate-limit errors put the account into cooldown; all other errors are
//! contained at the account boundary and reported.

mod report;

pub use report::{render_account_failure, render_report, AccountSummary, RunReport};

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::download::{DownloadError, Downloader, LocalFile};
use crate::retry::{download_backoff, upload_backoff, with_retries};
use crate::sink::{MediaGroup, SinkClient, SinkError};
use crate::source::{FetchDirection, Post, SourceClient, SourceError};
use crate::state::{
    AccountCursor, MediaRecord, MediaStatus, MediaType, StateError, StateStore,
};

/// Name of the durable lock row gating concurrent runs.
pub const JOB_NAME: &str = "daily-sync";

/// Content-addressed dedupe key: lowercase hex sha256 of
/// `post_id ∥ "::" ∥ media_url`. Stable across processes.
#[must_use]
pub fn media_key(post_id: &str, media_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(post_id.as_bytes());
    hasher.update(b"::");
    hasher.update(media_url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Errors crossing the engine's internal boundaries.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error routes into the cooldown state machine.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Source(source) if source.is_rate_limited())
    }
}

/// Engine knobs; defaults match the daemon's documented environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Account handles in processing order, without the leading `@`.
    pub accounts: Vec<String>,
    /// Scratch directory for staged downloads.
    pub download_dir: PathBuf,
    pub backfill_pages_per_run: u32,
    pub max_media_per_run: u32,
    pub job_lock_ttl_seconds: i64,
    pub max_upload_video_bytes: u64,
    pub rate_limit_cooldown_seconds: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            download_dir: PathBuf::from("/tmp/work"),
            backfill_pages_per_run: 10,
            max_media_per_run: 300,
            job_lock_ttl_seconds: 3300,
            max_upload_video_bytes: 512 * 1024 * 1024,
            rate_limit_cooldown_seconds: 7200,
        }
    }
}

/// Per-post outcome counters, merged into the account summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PostCounters {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PostCounters {
    fn merge(&mut self, other: PostCounters) {
        self.uploaded += other.uploaded;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Budget-bounded selection over merged candidates.
#[derive(Debug, Default)]
struct Selection {
    selected: Vec<Post>,
    incremental_selected: usize,
    backfill_selected: usize,
}

/// The sync engine over its three adapters and the downloader.
pub struct SyncEngine<S, C, K, D> {
    state: S,
    source: C,
    sink: K,
    downloader: D,
    config: EngineConfig,
}

impl<S, C, K, D> SyncEngine<S, C, K, D>
where
    S: StateStore,
    C: SourceClient,
    K: SinkClient,
    D: Downloader,
{
    pub fn new(state: S, source: C, sink: K, downloader: D, config: EngineConfig) -> Self {
        Self {
            state,
            source,
            sink,
            downloader,
            config,
        }
    }

    /// The state store, for lifecycle management by the caller.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Execute exactly one run.
    ///
    /// Fatal failures (schema bring-up, scratch directory, lock machinery)
    /// propagate; everything below the per-account boundary is contained in
    /// the report. The lock is always released on the way out.
    pub async fn run(&self) -> Result<RunReport, EngineError> {
        let started_at = Utc::now();
        let holder_id = format!(
            "sync-{}-{}",
            std::process::id(),
            started_at.timestamp_millis()
        );

        self.state.init().await?;
        tokio::fs::create_dir_all(&self.config.download_dir).await?;

        let acquired = self
            .state
            .acquire_lock(JOB_NAME, &holder_id, self.config.job_lock_ttl_seconds)
            .await?;
        if !acquired {
            tracing::warn!(holder = %holder_id, "another run holds the job lock, skipping");
            return Ok(RunReport {
                skipped_by_lock: true,
                started_at,
                finished_at: Utc::now(),
                accounts: Vec::new(),
            });
        }
        tracing::info!(holder = %holder_id, accounts = self.config.accounts.len(), "run started");

        let mut accounts = Vec::with_capacity(self.config.accounts.len());
        for handle in &self.config.accounts {
            accounts.push(self.sync_account(handle).await);
        }

        let report = RunReport {
            skipped_by_lock: false,
            started_at,
            finished_at: Utc::now(),
            accounts,
        };
        if let Err(error) = self.sink.send_text(&render_report(&report)).await {
            tracing::error!(%error, "failed to deliver run report");
        }

        if let Err(error) = self.state.release_lock(JOB_NAME, &holder_id).await {
            tracing::error!(%error, "failed to release job lock");
        }
        Ok(report)
    }

    /// Process one account, containing every error at this boundary.
    #[tracing::instrument(skip(self))]
    async fn sync_account(&self, handle: &str) -> AccountSummary {
        let cursor = match self.state.get_account(handle).await {
            Ok(cursor) => cursor,
            Err(error) => {
                tracing::error!(%error, "failed to load account cursor");
                let mut summary = AccountSummary::empty(handle);
                summary.failed = 1;
                return summary;
            }
        };

        let now = Utc::now();
        if cursor.in_cooldown(now) {
            tracing::info!(until = ?cursor.rate_limited_until, "account in cooldown, skipping");
            let mut summary = AccountSummary::empty(handle);
            summary.cooldown_active = true;
            summary.cooldown_until = cursor.rate_limited_until;
            summary.backfill_done = cursor.backfill_done;
            return summary;
        }

        match self.process_account(handle, &cursor).await {
            Ok(summary) => summary,
            Err(error) if error.is_rate_limited() => {
                // Cooldown is expected operation, not a failure to report.
                let until = Utc::now()
                    + Duration::seconds(self.config.rate_limit_cooldown_seconds);
                tracing::warn!(%error, until = %until, "rate limited, entering cooldown");

                let mut updated = cursor.clone();
                updated.rate_limited_until = Some(until);
                updated.updated_at = None;
                if let Err(persist_error) = self.state.put_account(updated).await {
                    tracing::error!(%persist_error, "failed to persist cooldown");
                }

                let mut summary = AccountSummary::empty(handle);
                summary.failed = 1;
                summary.cooldown_active = true;
                summary.cooldown_until = Some(until);
                summary.backfill_done = cursor.backfill_done;
                summary
            }
            Err(error) => {
                tracing::error!(%error, "account sync failed");

                // Re-persist the pre-run cursor fields unchanged.
                let mut unchanged = cursor.clone();
                unchanged.updated_at = None;
                if let Err(persist_error) = self.state.put_account(unchanged).await {
                    tracing::error!(%persist_error, "failed to re-persist cursor");
                }
                if let Err(send_error) = self
                    .sink
                    .send_text(&render_account_failure(handle, &error))
                    .await
                {
                    tracing::error!(%send_error, "failed to deliver failure report");
                }

                let mut summary = AccountSummary::empty(handle);
                summary.failed = 1;
                summary.backfill_done = cursor.backfill_done;
                summary
            }
        }
    }

    async fn process_account(
        &self,
        handle: &str,
        cursor: &AccountCursor,
    ) -> Result<AccountSummary, EngineError> {
        // Incremental: walk from the head until the last-seen post.
        let incremental = self
            .source
            .list_posts_with_media(
                handle,
                FetchDirection::Newer,
                None,
                self.config.backfill_pages_per_run,
            )
            .await?;
        let mut incremental_posts: Vec<Post> = Vec::new();
        for post in &incremental.posts {
            if cursor.latest_seen_post_id.as_deref() == Some(post.id.as_str()) {
                break;
            }
            incremental_posts.push(post.clone());
        }
        let newest_seen_id = incremental
            .posts
            .first()
            .map(|post| post.id.clone())
            .or_else(|| cursor.latest_seen_post_id.clone());

        // Backfill: continue into history unless it already terminated.
        let (backfill_posts, next_cursor, backfill_done) = if cursor.backfill_done {
            (Vec::new(), None, true)
        } else {
            let timeline = self
                .source
                .list_posts_with_media(
                    handle,
                    FetchDirection::Older,
                    cursor.backfill_cursor.as_deref(),
                    self.config.backfill_pages_per_run,
                )
                .await?;
            let done = timeline.next_cursor.is_none();
            (timeline.posts, timeline.next_cursor, done)
        };

        let (incremental_candidates, backfill_candidates) =
            merge_candidates(&incremental_posts, &backfill_posts);
        let selection = select_posts(
            &incremental_candidates,
            &backfill_candidates,
            self.config.max_media_per_run,
        );
        tracing::info!(
            incremental = incremental_candidates.len(),
            backfill = backfill_candidates.len(),
            selected = selection.selected.len(),
            "candidates merged"
        );

        let mut counters = PostCounters::default();
        for post in &selection.selected {
            counters.merge(self.process_post(handle, post).await?);
        }

        self.state
            .put_account(AccountCursor {
                handle: handle.to_string(),
                latest_seen_post_id: newest_seen_id,
                backfill_cursor: next_cursor,
                backfill_done,
                rate_limited_until: None,
                updated_at: None,
            })
            .await?;

        Ok(AccountSummary {
            handle: handle.to_string(),
            uploaded: counters.uploaded,
            skipped: counters.skipped,
            failed: counters.failed,
            incremental_candidates: incremental_candidates.len(),
            incremental_selected: selection.incremental_selected,
            backfill_candidates: backfill_candidates.len(),
            backfill_selected: selection.backfill_selected,
            backfill_done,
            cooldown_active: false,
            cooldown_until: None,
        })
    }

    /// Stage, deliver, and record one post's media. Every file staged here
    /// is deleted before this returns, on success and failure alike; errors
    /// other than rate limits are absorbed into the counters.
    async fn process_post(&self, handle: &str, post: &Post) -> Result<PostCounters, EngineError> {
        let dir = self.config.download_dir.join(handle);
        let mut counters = PostCounters::default();
        let mut staged: Vec<LocalFile> = Vec::new();

        let result = self
            .stage_and_send(handle, post, &dir, &mut counters, &mut staged)
            .await;

        for file in &staged {
            if let Err(error) = tokio::fs::remove_file(&file.path).await {
                tracing::warn!(path = %file.path.display(), %error, "failed to remove staged file");
            }
        }

        match result {
            Ok(()) => Ok(counters),
            Err(error) if error.is_rate_limited() => Err(error),
            Err(error) => {
                counters.failed += 1;
                tracing::error!(post_id = %post.id, handle, %error, "post processing failed");
                Ok(counters)
            }
        }
    }

    async fn stage_and_send(
        &self,
        handle: &str,
        post: &Post,
        dir: &std::path::Path,
        counters: &mut PostCounters,
        staged: &mut Vec<LocalFile>,
    ) -> Result<(), EngineError> {
        let mut to_send: Vec<LocalFile> = Vec::new();

        for media in &post.media {
            let key = media_key(&post.id, &media.url);
            if self.state.is_media_uploaded(&key).await? {
                counters.skipped += 1;
                continue;
            }

            let downloader = &self.downloader;
            let key_ref: &str = &key;
            let url: &str = &media.url;
            let media_type = media.media_type;
            let file = with_retries(
                move || downloader.download(key_ref, url, media_type, dir),
                download_backoff(),
                "download",
            )
            .await?;
            staged.push(file.clone());

            if file.media_type != MediaType::Photo
                && file.size_bytes > self.config.max_upload_video_bytes
            {
                tracing::info!(
                    media_key = %key,
                    size_bytes = file.size_bytes,
                    "video exceeds upload cap, recording skip"
                );
                self.state
                    .mark_media(MediaRecord {
                        media_key: key.clone(),
                        post_id: post.id.clone(),
                        account_handle: handle.to_string(),
                        media_url: media.url.clone(),
                        media_type: file.media_type,
                        uploaded_at: None,
                        sink_message_ids: Vec::new(),
                        status: MediaStatus::SkippedOversize,
                    })
                    .await?;
                tokio::fs::remove_file(&file.path).await?;
                staged.retain(|s| s.media_key != file.media_key);
                counters.skipped += 1;
                continue;
            }

            to_send.push(file);
        }

        if to_send.is_empty() {
            return Ok(());
        }

        let group = MediaGroup {
            post_url: post.url.clone(),
            handle: handle.to_string(),
            posted_at: post.posted_at,
            files: to_send,
        };
        let sink = &self.sink;
        let group_ref = &group;
        let message_ids = with_retries(
            move || sink.send_media_group(group_ref),
            upload_backoff(),
            "upload",
        )
        .await?;
        tracing::info!(
            post_id = %post.id,
            files = group.files.len(),
            messages = message_ids.len(),
            "media group delivered"
        );

        for (index, file) in group.files.iter().enumerate() {
            // One message per file when the sink reports them 1:1; keep the
            // whole id list otherwise.
            let sink_message_ids = if message_ids.len() == group.files.len() {
                vec![message_ids[index]]
            } else {
                message_ids.clone()
            };
            self.state
                .mark_media(MediaRecord {
                    media_key: file.media_key.clone(),
                    post_id: post.id.clone(),
                    account_handle: handle.to_string(),
                    media_url: file.media_url.clone(),
                    media_type: file.media_type,
                    uploaded_at: None,
                    sink_message_ids,
                    status: MediaStatus::Uploaded,
                })
                .await?;
            counters.uploaded += 1;
        }

        Ok(())
    }
}

/// Union incremental and backfill posts, deduplicated by id, sorted
/// ascending by numeric id, partitioned into incremental-first candidates.
fn merge_candidates(incremental: &[Post], backfill: &[Post]) -> (Vec<Post>, Vec<Post>) {
    let incremental_ids: HashSet<&str> = incremental.iter().map(|p| p.id.as_str()).collect();

    let mut merged: Vec<Post> = Vec::new();
    for post in incremental.iter().chain(backfill.iter()) {
        if !merged.iter().any(|existing| existing.id == post.id) {
            merged.push(post.clone());
        }
    }
    merged.sort_by_key(Post::numeric_id);

    merged
        .into_iter()
        .partition(|post| incremental_ids.contains(post.id.as_str()))
}

/// Select posts against the media budget, incremental candidates first.
///
/// A post whose media count exceeds the remaining budget is skipped unless
/// nothing has been selected yet, so the worst case is a single oversized
/// selection.
fn select_posts(incremental: &[Post], backfill: &[Post], max_media: u32) -> Selection {
    let mut budget = i64::from(max_media);
    let mut selection = Selection::default();

    let candidates = incremental
        .iter()
        .map(|post| (post, true))
        .chain(backfill.iter().map(|post| (post, false)));

    for (post, is_incremental) in candidates {
        if budget <= 0 {
            break;
        }
        let media_count = post.media.len() as i64;
        if media_count > budget && !selection.selected.is_empty() {
            continue;
        }
        selection.selected.push(post.clone());
        if is_incremental {
            selection.incremental_selected += 1;
        } else {
            selection.backfill_selected += 1;
        }
        budget -= media_count;
    }

    selection
}
