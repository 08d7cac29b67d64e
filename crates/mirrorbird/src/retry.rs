//! Bounded retry for per-media downloads and sink uploads.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Retries allowed after the first attempt of a download or upload.
pub const MAX_RETRIES: usize = 2;

/// Backoff for media downloads: 1 s initial delay, doubling.
#[must_use]
pub fn download_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_factor(2.0)
        .with_max_times(MAX_RETRIES)
}

/// Backoff for sink uploads: 1.5 s initial delay, doubling.
#[must_use]
pub fn upload_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1500))
        .with_factor(2.0)
        .with_max_times(MAX_RETRIES)
}

/// Run `operation` under `backoff`, logging each retry. All errors are
/// retryable at this level; classification happens above.
pub async fn with_retries<T, E, F, Fut>(
    operation: F,
    backoff: ExponentialBuilder,
    label: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    operation
        .retry(backoff)
        .notify(|err, delay| {
            tracing::warn!(label, retry_in = ?delay, error = %err, "operation failed, retrying");
        })
        .await
}
