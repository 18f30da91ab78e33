//! Decides which requests reach the proxy at all.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use dlcache_service::config::RateLimitConfig;
use dlcache_service::metric;

use super::ResponseError;

/// A process-wide token bucket.
///
/// The bucket starts full with `burst` tokens and refills at `per_second` tokens per second.
/// A `per_second` of zero disables rate limiting.
#[derive(Debug)]
pub struct RateLimiter {
    per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let burst = f64::from(config.burst.max(1));
        Self {
            per_second: f64::from(config.per_second),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Takes a token, if there is one.
    pub fn try_acquire(&self) -> bool {
        if self.per_second == 0.0 {
            return true;
        }

        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.burst);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Whether the peer is this machine.
///
/// Only the loopback addresses themselves count, not the whole `127.0.0.0/8` range.
fn is_loopback(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip == Ipv4Addr::LOCALHOST,
        IpAddr::V6(ip) => {
            ip == Ipv6Addr::LOCALHOST || ip.to_ipv4_mapped() == Some(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Rejects remote callers with `403` and rate limited requests with `429`.
pub async fn admit(
    State(limiter): State<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ResponseError> {
    if !is_loopback(&addr) {
        tracing::info!("Forbidden: {}", addr);
        metric!(counter("admission.rejected") += 1, "reason" => "remote");
        return Err((StatusCode::FORBIDDEN, "Forbidden").into());
    }

    if !limiter.try_acquire() {
        metric!(counter("admission.rejected") += 1, "reason" => "rate_limit");
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into());
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use dlcache_test::HitCounter;
    use tower::ServiceExt;

    use super::super::tests::{app, app_with_limit, request};
    use super::*;

    #[test]
    fn test_is_loopback() {
        for addr in ["127.0.0.1:1234", "[::1]:1234", "[::ffff:127.0.0.1]:1234"] {
            assert!(is_loopback(&addr.parse().unwrap()), "{addr}");
        }
        for addr in [
            "127.0.0.2:1234",
            "192.168.1.10:1234",
            "0.0.0.0:1234",
            "[::]:1234",
            "[::ffff:192.168.1.10]:1234",
            "[fe80::1]:1234",
        ] {
            assert!(!is_loopback(&addr.parse().unwrap()), "{addr}");
        }
    }

    #[test]
    fn test_token_bucket() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_second: 1,
            burst: 3,
        });

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_token_bucket_disabled() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_second: 0,
            burst: 1,
        });

        for _ in 0..100 {
            assert!(limiter.try_acquire());
        }
    }

    #[tokio::test]
    async fn test_remote_caller_forbidden() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let app = app(&server, cache_dir.path());

        let uri = format!("/{}", server.url("/file/1000"));
        let response = app
            .oneshot(request(Method::GET, &uri, "192.168.1.10:50000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(server.accesses(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let app = app_with_limit(
            &server,
            cache_dir.path(),
            RateLimitConfig {
                per_second: 1,
                burst: 1,
            },
        );

        let uri = format!("/{}", server.url("/file/1000"));
        let response = app
            .clone()
            .oneshot(request(Method::GET, &uri, "127.0.0.1:50000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request(Method::GET, &uri, "127.0.0.1:50000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(server.hits("/file/1000"), 1);
    }
}
