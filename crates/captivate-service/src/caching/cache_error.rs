use std::time::Duration;

use thiserror::Error;

use crate::remote::RemoteError;

/// An error that happens while resolving a cached value.
///
/// Errors are shared between all callers that joined the same lookup, hence `Clone`. They are
/// never written to the [`TtlStore`](super::TtlStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The remote application could not be reached, or the request got lost.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The remote application did not answer in time.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    /// The remote application answered, but the answer could not be understood.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The lookup was dropped before it could produce a value.
    #[error("internal error")]
    InternalError,
}

impl From<RemoteError> for CacheError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transport(details) => Self::Transport(details),
            RemoteError::Timeout(duration) => Self::Timeout(duration),
            RemoteError::Disconnected => Self::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl CacheError {
    /// A short, stable name for this kind of error, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internal",
        }
    }
}

/// The result of a cache lookup.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
