//! Source platform adapter: authenticated, paged retrieval of media-bearing
//! posts from public account timelines.
//!
//! The engine depends on the [`SourceClient`] trait; the production
//! implementation is [`GraphqlSourceClient`], which speaks the platform's
//! internal GraphQL dialect with host failover and credential rotation.

mod client;
pub mod cookies;
mod error;
mod timeline;

pub use client::GraphqlSourceClient;
pub use cookies::CookieBundle;
pub use error::SourceError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::state::MediaType;

/// Which end of the timeline a fetch walks toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchDirection {
    /// From the head of the timeline toward older posts; used for
    /// incremental catch-up, which stops at the last-seen post.
    Newer,
    /// From a stored continuation cursor further into history.
    Older,
}

/// A single media entity attached to a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub url: String,
    pub media_type: MediaType,
}

/// A post that carries at least one usable media entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    /// Opaque, numerically comparable post id.
    pub id: String,
    pub handle: String,
    /// Canonical permalink for captions and reports.
    pub url: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub media: Vec<MediaItem>,
}

impl Post {
    /// Numeric form of the id, used for ordering. Ids that fail to parse
    /// sort first.
    #[must_use]
    pub fn numeric_id(&self) -> u64 {
        self.id.parse().unwrap_or(0)
    }
}

/// One fetch's worth of media posts plus the older-direction continuation.
#[derive(Debug, Clone, Default)]
pub struct MediaTimeline {
    /// Media-bearing posts, newest first.
    pub posts: Vec<Post>,
    /// Bottom cursor; populated for older-direction fetches only, and absent
    /// when the platform stopped producing continuations.
    pub next_cursor: Option<String>,
}

/// Result of a minimal authenticated probe against the platform.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub logged_in: bool,
    /// Host that answered the probe successfully, when any did.
    pub host: Option<String>,
    /// Failure detail when not logged in.
    pub reason: Option<String>,
}

/// Read-side boundary the sync engine fetches timelines through.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch up to `page_limit` pages of media-bearing posts for `handle`.
    ///
    /// `cursor` seeds older-direction paging; newer-direction fetches start
    /// from the timeline head and ignore it.
    async fn list_posts_with_media(
        &self,
        handle: &str,
        direction: FetchDirection,
        cursor: Option<&str>,
        page_limit: u32,
    ) -> Result<MediaTimeline, SourceError>;

    /// Probe whether the configured credentials are accepted by any host.
    async fn check_session(&self) -> Result<SessionStatus, SourceError>;

    /// `check_session` plus a handle resolution; errors on any failure.
    async fn health_check(&self, handle: &str) -> Result<(), SourceError>;
}
