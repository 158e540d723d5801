//! Transfers of media from the origin into local files.
//!
//! The download scheduler does not talk HTTP itself. It drives a [`MediaFetcher`], which streams
//! the bytes of a single URL into a destination file and aborts as soon as it is cancelled.
//! [`HttpFetcher`] is the production implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::caching::CacheError;

mod http;

pub use http::HttpFetcher;

/// The result of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    /// The number of bytes written to the destination.
    pub bytes_written: u64,
    /// The length announced by the origin, if any.
    pub expected_len: Option<u64>,
}

/// Fetches media from an origin.
pub trait MediaFetcher: Send + Sync + 'static {
    /// Streams the media at `url` into `destination`.
    ///
    /// Implementations must check `cancel` at least once per chunk and return
    /// [`CacheError::Cancelled`] once it fired. They must not retry.
    fn fetch(
        &self,
        url: &Url,
        destination: &mut File,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<FetchOutcome, CacheError>> + Send;
}

impl<T: MediaFetcher> MediaFetcher for Arc<T> {
    fn fetch(
        &self,
        url: &Url,
        destination: &mut File,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<FetchOutcome, CacheError>> + Send {
        (**self).fetch(url, destination, cancel)
    }
}

/// Copies a stream of chunks into `destination`, checking `cancel` between chunks.
///
/// Returns the number of bytes written. The destination is flushed before returning.
pub async fn copy_stream<S>(
    stream: S,
    destination: &mut File,
    cancel: &CancellationToken,
) -> Result<u64, CacheError>
where
    S: Stream<Item = Result<Bytes, CacheError>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut bytes_written = 0;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk.transpose()? else {
            break;
        };
        destination.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    destination.flush().await?;

    Ok(bytes_written)
}

/// State of the [`MeasureDownloadGuard`].
#[derive(Clone, Copy, Debug)]
enum MeasureState {
    /// The download has not finished yet.
    Pending,
    /// The download has terminated with a status.
    Done(&'static str),
}

/// A guard measuring a single download.
///
/// Two metrics are emitted when dropped:
///
/// 1. `download.duration`: time taken until the guard was dropped
/// 2. `download.size`: bytes transferred, if any
///
/// A guard dropped without calling [`done`](Self::done) reports the status `"canceled"`.
pub struct MeasureDownloadGuard {
    state: MeasureState,
    creation_time: Instant,
    bytes_transferred: u64,
}

impl MeasureDownloadGuard {
    pub fn new() -> Self {
        Self {
            state: MeasureState::Pending,
            creation_time: Instant::now(),
            bytes_transferred: 0,
        }
    }

    /// Marks the download as terminated.
    pub fn done(mut self, result: &Result<FetchOutcome, CacheError>) {
        self.state = MeasureState::Done(match result {
            Ok(outcome) => {
                self.bytes_transferred = outcome.bytes_written;
                "ok"
            }
            Err(e) => e.as_tag(),
        });
    }
}

impl Default for MeasureDownloadGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MeasureDownloadGuard {
    fn drop(&mut self) {
        let status = match self.state {
            MeasureState::Pending => "canceled",
            MeasureState::Done(status) => status,
        };

        metric!(
            timer("download.duration") = self.creation_time.elapsed(),
            "status" => status,
        );
        if self.bytes_transferred > 0 {
            metric!(
                histogram("download.size") = self.bytes_transferred,
                "status" => status,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    async fn destination(dir: &tempfile::TempDir) -> (File, std::path::PathBuf) {
        let path = dir.path().join("out");
        (File::create(&path).await.unwrap(), path)
    }

    #[tokio::test]
    async fn test_copy_stream() {
        let dir = feedcache_test::tempdir();
        let (mut file, path) = destination(&dir).await;

        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let written = copy_stream(chunks, &mut file, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(std::fs::read(path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_copy_stream_cancelled() {
        let dir = feedcache_test::tempdir();
        let (mut file, _path) = destination(&dir).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let chunks = stream::iter(vec![Ok(Bytes::from_static(b"never"))]);

        let result = copy_stream(chunks, &mut file, &cancel).await;
        assert_eq!(result, Err(CacheError::Cancelled));
    }

    #[tokio::test]
    async fn test_copy_stream_error() {
        let dir = feedcache_test::tempdir();
        let (mut file, _path) = destination(&dir).await;

        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(CacheError::DownloadError("connection reset".into())),
        ]);

        let result = copy_stream(chunks, &mut file, &CancellationToken::new()).await;
        assert_eq!(
            result,
            Err(CacheError::DownloadError("connection reset".into()))
        );
    }
}
