//! Fetching responses from the allowlisted origins.

use std::error::Error;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use reqwest::{StatusCode, header};
use url::Url;

use crate::error::ProxyError;
use crate::utils::http::{DownloadTimeouts, create_client};
use crate::utils::redact_query;

pub const USER_AGENT: &str = concat!("dlcache/", env!("CARGO_PKG_VERSION"));

impl ProxyError {
    /// Describes a transport error by its innermost cause, which is usually the most useful part.
    fn transport_error(mut error: &dyn Error) -> String {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }
        if error_string.contains("invalid peer certificate") {
            error_string = "invalid peer certificate".to_string();
        }

        error_string
    }
}

/// Downloads whole response bodies from the origin.
#[derive(Debug, Clone)]
pub struct OriginDownloader {
    client: reqwest::Client,
    timeouts: DownloadTimeouts,
}

impl OriginDownloader {
    pub fn new(client: reqwest::Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    pub fn from_timeouts(timeouts: DownloadTimeouts) -> reqwest::Result<Self> {
        Ok(Self::new(create_client(&timeouts)?, timeouts))
    }

    /// Downloads the body of `url`.
    ///
    /// Only a `200 OK` response with a complete body is a success. The whole download, including
    /// reading the body, is bounded by the `max_download` timeout.
    pub async fn download(&self, url: &Url) -> Result<Bytes, ProxyError> {
        let source = redact_query(url.as_str());
        tracing::debug!("Fetching `{}`", source);

        let start = Instant::now();
        let timeout = self.timeouts.max_download;
        let result = match tokio::time::timeout(timeout, self.download_inner(url)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::OriginTimeout(timeout)),
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metric!(timer("download.duration") = start.elapsed(), "status" => status);

        match &result {
            Ok(body) => {
                tracing::trace!("Success hitting `{}`: {} bytes", source, body.len());
                metric!(histogram("download.size") = body.len() as u64);
            }
            Err(e) => tracing::debug!("Failed to fetch `{}`: {}", source, e),
        }

        result
    }

    async fn download_inner(&self, url: &Url) -> Result<Bytes, ProxyError> {
        let mut response = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ProxyError::OriginBadStatus(status));
        }

        // `Response::content_length` reports the size hint of the body, which is not the same
        // thing as the header for all responses.
        let expected = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());

        let mut body = BytesMut::with_capacity(
            expected.map_or(0, |len| len.min(64 * 1024 * 1024)) as usize,
        );
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => {
                    let actual = body.len() as u64;
                    return Err(match expected {
                        _ if e.is_timeout() => ProxyError::OriginTimeout(self.timeouts.max_download),
                        Some(expected) if actual < expected => {
                            ProxyError::OriginTruncated { expected, actual }
                        }
                        _ => ProxyError::OriginRead(ProxyError::transport_error(&e)),
                    });
                }
            }
        }

        let actual = body.len() as u64;
        if let Some(expected) = expected {
            if actual != expected {
                return Err(ProxyError::OriginTruncated { expected, actual });
            }
        }

        Ok(body.freeze())
    }

    fn send_error(&self, error: reqwest::Error) -> ProxyError {
        if error.is_timeout() {
            ProxyError::OriginTimeout(self.timeouts.max_download)
        } else {
            ProxyError::OriginUnreachable(ProxyError::transport_error(&error))
        }
    }
}
