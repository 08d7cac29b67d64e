//! Sink platform adapter: delivery of media groups and text reports to the
//! private archive channel.
//!
//! The engine depends on the [`SinkClient`] trait. Group chunking and caption
//! rendering are pure helpers here so the production client and test fakes
//! share one policy.

mod telegram;

pub use telegram::{SinkCredentials, TelegramSink};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::download::LocalFile;

/// Maximum number of media per album send.
pub const MAX_GROUP_SIZE: usize = 10;

/// Opaque message id returned by the sink.
pub type MessageId = i64;

/// An ordered set of local files to archive for one post.
#[derive(Debug, Clone)]
pub struct MediaGroup {
    pub post_url: String,
    pub handle: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub files: Vec<LocalFile>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink API error: {message}")]
    Api { message: String },

    #[error("sink transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    #[inline]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }
}

/// Delivery boundary for the archive channel.
#[async_trait]
pub trait SinkClient: Send + Sync {
    /// Send the group's files, partitioned into albums of at most
    /// [`MAX_GROUP_SIZE`], and return all message ids in send order.
    async fn send_media_group(&self, group: &MediaGroup) -> Result<Vec<MessageId>, SinkError>;

    /// Post a plain text message to the channel.
    async fn send_text(&self, text: &str) -> Result<(), SinkError>;

    async fn health_check(&self) -> Result<(), SinkError>;

    async fn disconnect(&self) -> Result<(), SinkError>;
}

/// Caption for chunk `part_index` (zero-based) of a group: handle, post
/// timestamp, permalink, and a part marker for every chunk after the first.
#[must_use]
pub fn chunk_caption(group: &MediaGroup, part_index: usize) -> String {
    let mut lines = vec![format!("@{}", group.handle)];
    if let Some(posted_at) = group.posted_at {
        lines.push(posted_at.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    lines.push(group.post_url.clone());
    if part_index > 0 {
        lines.push(format!("[part {}]", part_index + 1));
    }
    lines.join("\n")
}

/// Partition a group's files into album-sized chunks.
#[must_use]
pub fn chunks(files: &[LocalFile]) -> Vec<&[LocalFile]> {
    files.chunks(MAX_GROUP_SIZE).collect()
}
