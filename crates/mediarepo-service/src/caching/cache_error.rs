use std::time::Duration;

use thiserror::Error;

/// An error that happens when producing a piece of content.
///
/// This error is `Clone` so a single outcome can be handed to every caller that joined a
/// coalesced computation. All variants except [`InternalError`](Self::InternalError) describe
/// the requested resource and may be remembered for a while.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource does not exist upstream.
    #[error("not found")]
    NotFound,
    /// The resource exceeds a configured size ceiling.
    #[error("too large")]
    TooLarge,
    /// A cache or backend is transiently down.
    ///
    /// Cache layers never surface this, they degrade to a miss instead.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Fetching the resource took too long.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched from its origin, like connection loss or a 5xx
    /// server response.
    ///
    /// The attached string contains the remote server's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The resource was fetched, but could not be processed.
    ///
    /// For example, a thumbnail could not be generated from an unsupported image.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error, including panics inside of pooled work.
    ///
    /// This variant is never remembered, the next request retries.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Whether this outcome may be served to later callers instead of retrying.
    pub fn is_memorable(&self) -> bool {
        !matches!(self, Self::InternalError)
    }

    /// A short name of the variant, used to tag metrics.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::TooLarge => "toolarge",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internalerror",
        }
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting the reason why a
/// resource could not be produced or is otherwise unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
