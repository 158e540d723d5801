//! Helpers for testing the prefetch services against a real HTTP origin.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The cache recreates its directories lazily, so a directory
//!    dropped too early is silently leaked.
//!
//!  - When using a [`MediaServer`], hold it until all requests to it have been made. Once it is
//!    dropped, connections to its port are refused.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Router, extract, middleware};
use bytes::Bytes;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Size of the chunks sent by the `/slow/` route.
const SLOW_CHUNK: usize = 1024;
/// Pause before each chunk of the `/slow/` route.
const SLOW_INTERVAL: Duration = Duration::from_millis(20);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `feedcache_service` crate and
///    mutes all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("feedcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// The deterministic media payload of `len` bytes served by the [`MediaServer`].
pub fn media_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A media origin counting the requests to each path.
///
/// Routes:
///
///  - `/media/:size` and `/media/:size/*name`: [`media_bytes`] of the given size, with a
///    `Content-Length`.
///  - `/slow/:size`: the same payload, trickled out in 1 KiB chunks every 20ms.
///  - `/status/:code`: an empty response with the given status code.
///  - `/redirect/*path`: redirects to `/path`.
///  - `/delay/:time/*path`: waits for the humantime duration, then redirects to `/path`.
pub struct MediaServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl MediaServer {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        *hits.entry(uri.path().to_owned()).or_default() += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/media/:size", get(media))
            .route(
                "/media/:size/*name",
                get(
                    |extract::Path((size, _)): extract::Path<(usize, String)>| media(extract::Path(size)),
                ),
            )
            .route("/slow/:size", get(slow))
            .route(
                "/status/:code",
                get(|extract::Path(code): extract::Path<u16>| async move {
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .route(
                "/redirect/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                }),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The number of requests made to `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for MediaServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn media(extract::Path(size): extract::Path<usize>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "video/mp4")], media_bytes(size))
}

async fn slow(extract::Path(size): extract::Path<usize>) -> impl IntoResponse {
    let payload = Bytes::from(media_bytes(size));

    let chunks = futures::stream::unfold(0, move |offset| {
        let payload = payload.clone();
        async move {
            if offset >= payload.len() {
                return None;
            }
            tokio::time::sleep(SLOW_INTERVAL).await;
            let end = (offset + SLOW_CHUNK).min(payload.len());
            Some((Ok::<_, std::io::Error>(payload.slice(offset..end)), end))
        }
    });

    (
        [(header::CONTENT_LENGTH, size.to_string())],
        Body::from_stream(chunks),
    )
}
