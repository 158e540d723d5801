//! Scripted downloads for exercising the services without a network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use tokio::fs::File;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::caching::{CacheDir, CacheError};
use crate::download::{FetchOutcome, MediaFetcher, copy_stream};

/// How the [`ScriptedFetcher`] answers a URL.
#[derive(Debug, Clone)]
pub enum Script {
    /// Serve this many bytes.
    Serve(usize),
    /// Wait for the notification, then serve this many bytes.
    Gated(Arc<Notify>, usize),
    /// Write this many bytes, then stall until cancelled.
    Hang(usize),
    /// Fail with the error.
    Fail(CacheError),
    /// Announce one length and deliver another.
    Short { announced: u64, actual: usize },
}

/// A fetcher answering from a script. Unscripted URLs serve 16 bytes.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    started: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn script(&self, url: &Url, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }

    /// All fetched URLs, in the order the fetches started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn calls(&self, url: &Url) -> usize {
        let url = url.as_str();
        self.started.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

async fn serve(
    len: usize,
    destination: &mut File,
    cancel: &CancellationToken,
) -> Result<FetchOutcome, CacheError> {
    let chunks = stream::iter(vec![Ok(Bytes::from(vec![7u8; len]))]);
    let bytes_written = copy_stream(chunks, destination, cancel).await?;
    Ok(FetchOutcome {
        bytes_written,
        expected_len: Some(len as u64),
    })
}

impl MediaFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        url: &Url,
        destination: &mut File,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, CacheError> {
        self.started.lock().unwrap().push(url.to_string());
        let script = self.scripts.lock().unwrap().get(url.as_str()).cloned();

        match script.unwrap_or(Script::Serve(16)) {
            Script::Serve(len) => serve(len, destination, cancel).await,
            Script::Gated(gate, len) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                    _ = gate.notified() => {}
                }
                serve(len, destination, cancel).await
            }
            Script::Hang(len) => {
                serve(len, destination, cancel).await?;
                cancel.cancelled().await;
                Err(CacheError::Cancelled)
            }
            Script::Fail(error) => Err(error),
            Script::Short { announced, actual } => {
                let outcome = serve(actual, destination, cancel).await?;
                Ok(FetchOutcome {
                    expected_len: Some(announced),
                    ..outcome
                })
            }
        }
    }
}

/// A media URL that no server answers. Use with the [`ScriptedFetcher`].
pub fn media_url(name: &str) -> Url {
    format!("https://cdn.feed.test/v/{name}.mp4").parse().unwrap()
}

pub fn tmp_is_empty(dir: &CacheDir) -> bool {
    std::fs::read_dir(dir.tmp_dir()).unwrap().next().is_none()
}

/// All files below the data directory.
pub fn data_files(dir: &CacheDir) -> Vec<PathBuf> {
    fn walk(path: &Path, files: &mut Vec<PathBuf>) {
        for entry in std::fs::read_dir(path).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, files);
            } else {
                files.push(path);
            }
        }
    }

    let mut files = Vec::new();
    walk(dir.data_dir(), &mut files);
    files
}

/// Replaces the directory at `path` with a plain file, so that nothing can be written below it.
pub fn break_dir(path: &Path) {
    std::fs::remove_dir_all(path).unwrap();
    std::fs::write(path, b"").unwrap();
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
