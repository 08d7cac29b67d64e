//! Source platform error taxonomy.

use thiserror::Error;

/// Errors raised by the source adapter.
///
/// Rate limiting is a distinct variant carrying the exhausted host set, so
/// the engine can route it into the cooldown state machine instead of the
/// per-account failure report.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Every candidate host answered with a rate-limit signal.
    #[error("rate limited by all hosts: {}", hosts.join(", "))]
    RateLimited { hosts: Vec<String> },

    /// Credential rotation exhausted; operator intervention required.
    #[error("authentication rejected: {message}")]
    AuthInvalid { message: String },

    /// API-level failure (non-2xx status or an errors[] payload).
    #[error("API error: {message}")]
    Api { message: String },

    /// Transport-level failure.
    #[error("network error: {message}")]
    Network { message: String },

    /// The cookie bundle is missing, malformed, or lacks required cookies.
    #[error("cookie bundle error: {message}")]
    Cookies { message: String },

    /// The response did not have the expected shape.
    #[error("unexpected response: {message}")]
    Parse { message: String },
}

impl SourceError {
    #[inline]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthInvalid {
            message: message.into(),
        }
    }

    #[inline]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    #[inline]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    #[inline]
    pub fn cookies(message: impl Into<String>) -> Self {
        Self::Cookies {
            message: message.into(),
        }
    }

    #[inline]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Whether this error should enter the cooldown state machine.
    #[inline]
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
