use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// The `User-Agent` sent with every media request.
pub const USER_AGENT: &str = concat!("feedcache/", env!("CARGO_PKG_VERSION"));

/// Various timeouts for media downloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the first headers.
    pub head: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            head: Duration::from_secs(5),
            max_download: Duration::from_secs(60),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// The overall download deadline is not set on the client, the scheduler enforces it around
/// each transfer.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(5))
        .build()
}
