//! Support to download media from HTTP origins.

use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::caching::CacheError;
use crate::config::Config;
use crate::utils::http::{DownloadTimeouts, create_client};

use super::{FetchOutcome, MediaFetcher, copy_stream};

/// Fetcher implementation that downloads media with a plain `GET`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Creates a fetcher with a client configured from `config`.
    pub fn from_config(config: &Config) -> Result<Self, CacheError> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts)?;
        Ok(Self::new(client, timeouts))
    }
}

impl MediaFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        destination: &mut File,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, CacheError> {
        tracing::debug!("Fetching media from `{}`", url);

        let request = self.client.get(url.clone()).send();
        let request = tokio::time::timeout(self.timeouts.head, request);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            response = request => response.map_err(|_| CacheError::Timeout(self.timeouts.head))??,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }

        let expected_len = response.content_length();
        let stream = response.bytes_stream().map_err(CacheError::from);
        let bytes_written = copy_stream(stream, destination, cancel).await?;

        Ok(FetchOutcome {
            bytes_written,
            expected_len,
        })
    }
}

fn status_error(url: &Url, status: StatusCode) -> CacheError {
    if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        tracing::debug!("Media not found at `{url}`: {status}");
        CacheError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        CacheError::DownloadError(status.to_string())
    }
}
