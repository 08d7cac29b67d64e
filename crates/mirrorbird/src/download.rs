//! Media downloader: streams a remote URL to a deterministic local path.
//!
//! No retry policy lives here; the engine wraps downloads in its own bounded
//! retry.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::state::MediaType;

/// A media file staged on local disk, ready for the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub media_key: String,
    pub media_url: String,
    pub media_type: MediaType,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed with status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("download transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("download I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boundary the engine downloads media through.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Stream `media_url` into `<dir>/<media_key><ext>` and report its size.
    async fn download(
        &self,
        media_key: &str,
        media_url: &str,
        media_type: MediaType,
        dir: &Path,
    ) -> Result<LocalFile, DownloadError>;
}

/// Production downloader over a shared reqwest client.
#[derive(Clone, Default)]
pub struct HttpDownloader {
    http: reqwest::Client,
}

impl HttpDownloader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

/// Deterministic local path for a media item.
pub fn local_path(dir: &Path, media_key: &str, media_type: MediaType) -> PathBuf {
    dir.join(format!("{media_key}{}", media_type.extension()))
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        media_key: &str,
        media_url: &str,
        media_type: MediaType,
        dir: &Path,
    ) -> Result<LocalFile, DownloadError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = local_path(dir, media_key, media_type);

        let response = self.http.get(media_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: media_url.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        let mut size_bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::debug!(media_key, size_bytes, path = %path.display(), "downloaded media");

        Ok(LocalFile {
            media_key: media_key.to_string(),
            media_url: media_url.to_string(),
            media_type,
            path,
            size_bytes,
        })
    }
}
