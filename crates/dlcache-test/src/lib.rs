//! Helpers for testing the proxy and its service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the cache directories are deleted
//!    while the test still uses them. To avoid this, assign it to a variable in the test function
//!    (e.g. `let cache_dir = dlcache_test::tempdir()`).
//!
//!  - When using [`HitCounter`], make sure that the server is held until all requests to it have
//!    been made. A dropped server stops serving, and all connections to it will fail.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{self, Request};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// The `Content-Length` advertised by the `/truncated` route.
pub const TRUNCATED_ADVERTISED: u64 = 1000;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `dlcache` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("dlcache=trace,dlcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// The body served by the `/file/:size` route.
pub fn file_contents(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
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
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
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
    ///
    /// This URL uses `127.0.0.1` as hostname.
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

/// An origin server that counts the requests to each of its paths.
///
/// Routes:
///
///  - `/file/:size`: `size` bytes of [`file_contents`].
///  - `/delay/:time/file/:size`: the same, after sleeping for a `humantime` duration.
///  - `/status/:code`: an empty response with the given status code.
///  - `/truncated`: advertises [`TRUNCATED_ADVERTISED`] bytes, but only sends 10.
///
/// Paths are counted including their query string.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/file/:size",
                get(|extract::Path(size): extract::Path<usize>| async move {
                    file_contents(size)
                }),
            )
            .route(
                "/delay/:time/file/:size",
                get(
                    |extract::Path((time, size)): extract::Path<(String, usize)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        file_contents(size)
                    },
                ),
            )
            .route(
                "/status/:code",
                get(|extract::Path(code): extract::Path<u16>| async move {
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .route("/truncated", get(truncated))
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The total number of requests, over all paths.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    /// The number of requests to `path`, which must include the query string if there was one.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// The address of this server as an allowlist prefix, e.g. `127.0.0.1:1234/`.
    pub fn prefix(&self) -> String {
        format!("127.0.0.1:{}/", self.server.port())
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends a few bytes of a body with a larger `Content-Length`, then stalls and hangs up.
async fn truncated() -> Response {
    let stream = futures::stream::unfold(0, |state| async move {
        match state {
            0 => Some((Ok::<_, std::io::Error>(vec![b'x'; 10]), 1)),
            1 => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some((Err(std::io::Error::other("connection reset")), 2))
            }
            _ => None,
        }
    });

    (
        [(header::CONTENT_LENGTH, TRUNCATED_ADVERTISED.to_string())],
        Body::from_stream(stream),
    )
        .into_response()
}
