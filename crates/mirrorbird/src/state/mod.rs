//! Durable sync state: account cursors, the media dedupe registry, and the
//! job lock that serialises runs.
//!
//! The engine only ever talks to the [`StateStore`] trait; the production
//! implementation is [`SqliteStore`]. Tests substitute an in-memory store via
//! [`SqliteStore::in_memory`].

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Kind of media attached to a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Photo,
    Video,
    Gif,
}

impl MediaType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
            MediaType::Gif => "gif",
        }
    }

    /// File extension used for downloaded media of this type.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            MediaType::Photo => ".jpg",
            MediaType::Video | MediaType::Gif => ".mp4",
        }
    }

    fn parse(s: &str) -> Result<Self, StateError> {
        match s {
            "photo" => Ok(MediaType::Photo),
            "video" => Ok(MediaType::Video),
            "gif" => Ok(MediaType::Gif),
            other => Err(StateError::corrupt(format!("unknown media type {other:?}"))),
        }
    }
}

/// Terminal state of a media registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    /// Delivered to the sink.
    Uploaded,
    /// Deliberately dropped because the video exceeded the size cap.
    SkippedOversize,
}

impl MediaStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaStatus::Uploaded => "uploaded",
            MediaStatus::SkippedOversize => "skipped_oversize",
        }
    }

    fn parse(s: &str) -> Result<Self, StateError> {
        match s {
            "uploaded" => Ok(MediaStatus::Uploaded),
            "skipped_oversize" => Ok(MediaStatus::SkippedOversize),
            other => Err(StateError::corrupt(format!("unknown media status {other:?}"))),
        }
    }
}

/// Per-account sync progress.
///
/// Created implicitly on first read (a zero-valued cursor) and mutated only
/// by the engine at the end of an account's processing inside a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCursor {
    /// Account handle, without the leading `@`.
    pub handle: String,
    /// Newest post id the engine has ever observed for this account.
    pub latest_seen_post_id: Option<String>,
    /// Continuation token for older-direction paging.
    pub backfill_cursor: Option<String>,
    /// Once true, older-direction fetches are skipped forever.
    pub backfill_done: bool,
    /// While set and in the future, the account is in cooldown.
    pub rate_limited_until: Option<DateTime<Utc>>,
    /// Timestamp of the last mutation; defaulted to "now" on write when unset.
    pub updated_at: Option<DateTime<Utc>>,
}

impl AccountCursor {
    /// The zero-valued cursor returned for accounts that have never synced.
    #[must_use]
    pub fn empty(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            latest_seen_post_id: None,
            backfill_cursor: None,
            backfill_done: false,
            rate_limited_until: None,
            updated_at: None,
        }
    }

    /// Whether the account is currently suppressed by a rate-limit cooldown.
    #[must_use]
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }
}

/// One row of the media dedupe registry.
///
/// Inserted exactly once per media, either after a successful sink upload or
/// as an explicit oversize skip. Presence of the key is the dedupe signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRecord {
    /// Content-addressed key: lowercase hex sha256 of `post_id ∥ "::" ∥ media_url`.
    pub media_key: String,
    pub post_id: String,
    pub account_handle: String,
    pub media_url: String,
    pub media_type: MediaType,
    /// Defaulted to "now" on write when unset.
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Message ids returned by the sink, in send order. Empty for skips.
    pub sink_message_ids: Vec<i64>,
    pub status: MediaStatus,
}

/// State persistence errors. Lock contention is a return value, never an error.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("state store is closed")]
    Closed,

    #[error("corrupt state row: {message}")]
    Corrupt { message: String },

    #[error("blocking task failed: {message}")]
    Task { message: String },
}

impl StateError {
    fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}

/// Durable persistence boundary for the sync engine.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Idempotent schema bring-up. Creates missing relations and applies the
    /// additive `rate_limited_until` migration to pre-existing schemas.
    async fn init(&self) -> Result<(), StateError>;

    /// Returns the stored cursor, or [`AccountCursor::empty`] if absent.
    async fn get_account(&self, handle: &str) -> Result<AccountCursor, StateError>;

    /// Upsert by handle; `updated_at` defaults to "now" when unset.
    async fn put_account(&self, cursor: AccountCursor) -> Result<(), StateError>;

    async fn is_media_uploaded(&self, media_key: &str) -> Result<bool, StateError>;

    /// Insert-or-replace by `media_key`.
    async fn mark_media(&self, record: MediaRecord) -> Result<(), StateError>;

    /// Atomically claim the named job lock for `ttl_seconds`.
    ///
    /// Returns `false` (not an error) when another holder owns an unexpired
    /// lock. The observe/decide/write cycle runs inside an immediate write
    /// transaction so two callers cannot both succeed.
    async fn acquire_lock(
        &self,
        job_name: &str,
        holder_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, StateError>;

    /// Delete the lock row if and only if `holder_id` matches the current
    /// holder. A mismatched holder is a no-op.
    async fn release_lock(&self, job_name: &str, holder_id: &str) -> Result<(), StateError>;

    /// Release the underlying database handle.
    async fn close(&self) -> Result<(), StateError>;
}
