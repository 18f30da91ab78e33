use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::caching::PathEscapeError;

/// An error that prevents a request from being answered with a body.
///
/// Failing to read or write a cache file is deliberately not part of this enum: those errors are
/// logged and the request falls back to the origin, or is answered from the fetched bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// The target is not on the allowlist, or not a valid URL.
    #[error("forbidden path")]
    Forbidden,
    /// The derived cache path left its tier directory.
    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),
    /// The origin could not be reached.
    #[error("failed to fetch URL: {0}")]
    OriginUnreachable(String),
    /// The origin did not respond in time.
    #[error("download timed out after {0:?}")]
    OriginTimeout(Duration),
    /// The origin responded with something other than `200 OK`.
    #[error("status code error: {0}")]
    OriginBadStatus(StatusCode),
    /// The body did not have the length the origin advertised.
    #[error("data ended early: expected {expected} bytes, got {actual}")]
    OriginTruncated { expected: u64, actual: u64 },
    /// Reading the body from the origin failed.
    #[error("failed to read response: {0}")]
    OriginRead(String),
}

impl ProxyError {
    /// A short, stable name used to tag metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Forbidden => "forbidden",
            Self::PathEscape(_) => "path_escape",
            Self::OriginUnreachable(_) => "unreachable",
            Self::OriginTimeout(_) => "timeout",
            Self::OriginBadStatus(_) => "bad_status",
            Self::OriginTruncated { .. } => "truncated",
            Self::OriginRead(_) => "read",
        }
    }
}
