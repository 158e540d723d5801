use std::error::Error;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching or storing a media asset.
///
/// None of these errors are fatal. A failed asset simply isn't resident, and playback falls
/// back to the remote URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The media was not found at the origin.
    #[error("not found")]
    NotFound,
    /// The media could not be fetched from the origin due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The media could not be fetched from the origin due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the origin's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The transfer completed, but the number of bytes does not match what the origin announced.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    /// The media is larger than the whole cache budget.
    #[error("media of {size} bytes exceeds the cache budget of {budget} bytes")]
    TooLarge { size: u64, budget: u64 },
    /// The disk holding the cache directory ran out of space.
    #[error("storage full")]
    StorageFull,
    /// The download was cancelled because its asset left the prefetch window.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in feedcache itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull => {
                tracing::warn!(error = &err as &dyn Error, "cache storage is full");
                Self::StorageFull
            }
            _ => Self::from_std_error(err),
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    pub(crate) fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }

    /// Whether the error came from talking to the origin.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::Timeout(_) | Self::DownloadError(_)
        )
    }

    /// Whether the error came from writing to the local cache directory.
    ///
    /// Media that is rejected for its size is not a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StorageFull | Self::InternalError)
    }

    /// A short, stable name of the error usable as a metrics tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::SizeMismatch { .. } => "sizemismatch",
            Self::TooLarge { .. } => "toolarge",
            Self::StorageFull => "storagefull",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internalerror",
        }
    }
}
