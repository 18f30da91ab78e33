use std::time::Duration;

use reqwest::redirect;

/// Timeouts for origin downloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download, including reading the whole body.
    pub max_download: Duration,
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            max_download: Duration::from_secs(10 * 60),
        }
    }
}

/// Creates a [`reqwest::Client`] for fetching from origins.
///
/// Response bodies are not transparently decompressed, so that the cached bytes are exactly the
/// bytes the origin sent and the advertised `Content-Length` can be verified.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(10))
        .build()
}
