//! The caching proxy service.
//!
//! [`ProxyService::fetch`] answers a single proxied request: it checks the target against the
//! allowlist, serializes concurrent requests for the same URL through the per-key lock, and
//! either serves the cached body or downloads, validates and stores it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use url::Url;

use crate::bandwidth::BandwidthCounter;
use crate::caching::{CacheKey, CacheLocks, CacheTier, Caches, Sweeper, TierCache};
use crate::config::Config;
use crate::download::OriginDownloader;
use crate::error::ProxyError;
use crate::policy::{Classification, PolicyTable};
use crate::utils::redact_query;

/// Where a request target is fetched from and cached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// The absolute URL that is fetched from the origin.
    pub url: Url,
    pub key: CacheKey,
    pub tier: CacheTier,
    /// The cache file, inside of the tier directory.
    pub path: PathBuf,
    pub classification: Classification,
}

/// Whether a response was served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

/// A successfully proxied response body.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub body: Bytes,
    pub cache_status: CacheStatus,
}

#[derive(Debug, Clone)]
pub struct ProxyService {
    policies: Arc<PolicyTable>,
    caches: Arc<Caches>,
    locks: CacheLocks,
    downloader: Arc<OriginDownloader>,
    bandwidth: Arc<BandwidthCounter>,
    min_cache_size: u64,
}

impl ProxyService {
    /// Creates the service and everything it needs from the config.
    ///
    /// This creates the cache directories and loads the persisted bandwidth counter.
    pub fn create(config: &Config) -> anyhow::Result<Self> {
        let caches = Caches::from_config(config).context("failed to create local caches")?;
        let downloader = OriginDownloader::from_timeouts(config.timeouts())
            .context("failed to create HTTP client")?;
        let bandwidth = BandwidthCounter::load(&config.bandwidth_file);

        Ok(Self::new(
            PolicyTable::new(config.policies.clone()),
            caches,
            downloader,
            Arc::new(bandwidth),
            config.caches.min_cache_size,
        ))
    }

    pub fn new(
        policies: PolicyTable,
        caches: Caches,
        downloader: OriginDownloader,
        bandwidth: Arc<BandwidthCounter>,
        min_cache_size: u64,
    ) -> Self {
        Self {
            policies: Arc::new(policies),
            caches: Arc::new(caches),
            locks: CacheLocks::new(),
            downloader: Arc::new(downloader),
            bandwidth,
            min_cache_size,
        }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn locks(&self) -> &CacheLocks {
        &self.locks
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthCounter> {
        &self.bandwidth
    }

    /// Creates a [`Sweeper`] sharing this service's caches, locks and bandwidth counter.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.caches),
            self.locks.clone(),
            Arc::clone(&self.bandwidth),
        )
    }

    /// Works out the fetch URL and cache location of a request target.
    ///
    /// The target is the percent-decoded request path without its leading slash, followed by
    /// the query string if there is one.
    pub fn resolve(&self, target: &str) -> Result<ResolvedTarget, ProxyError> {
        let classification = self.policies.classify(target);
        if !classification.allowed {
            tracing::info!("Forbidden: {}", redact_query(target));
            return Err(ProxyError::Forbidden);
        }

        let Some(url) = self.policies.resolve_url(target) else {
            tracing::warn!("Forbidden, invalid URL: {}", redact_query(target));
            return Err(ProxyError::Forbidden);
        };

        let key = CacheKey::from_url(url.as_str());
        let tier = classification.tier();
        let path = self.caches.tier(tier).path_for(&key).map_err(|e| {
            tracing::error!("Invalid cache path: {}", e);
            e
        })?;

        Ok(ResolvedTarget {
            url,
            key,
            tier,
            path,
            classification,
        })
    }

    /// Answers a proxied request from the cache, or from the origin.
    pub async fn fetch(&self, target: &str) -> Result<ProxyResponse, ProxyError> {
        let resolved = self.resolve(target)?;
        let source = redact_query(resolved.url.as_str());
        let cache = self.caches.tier(resolved.tier);

        let _guard = self.locks.acquire(&resolved.key).await;

        match cache.read(&resolved.path).await {
            Ok(Some(body)) => {
                self.bandwidth.record(body.len() as u64);
                metric!(counter("proxy.cache.hit") += 1, "cache" => resolved.tier.as_ref());
                tracing::info!("From cache: {}", source);
                return Ok(ProxyResponse {
                    body,
                    cache_status: CacheStatus::Hit,
                });
            }
            Ok(None) => {}
            Err(e) => {
                // Treat unreadable files like missing ones, a successful download replaces them.
                tracing::error!("Failed to read cache file `{}`: {}", resolved.path.display(), e);
            }
        }

        metric!(counter("proxy.cache.miss") += 1, "cache" => resolved.tier.as_ref());
        tracing::info!("Downloading: {}", source);

        let body = match self.downloader.download(&resolved.url).await {
            Ok(body) => body,
            Err(e) => {
                metric!(counter("proxy.origin.error") += 1, "kind" => e.kind());
                tracing::warn!("{}: {}", source, e);
                return Err(e);
            }
        };

        let len = body.len() as u64;
        let min_valid_size = resolved.classification.min_valid_size;
        if len < self.min_cache_size {
            tracing::info!("Not caching (min cache size): {} bytes: {}", len, source);
        } else if len <= min_valid_size {
            tracing::info!("Not caching (min url size): {} bytes: {}", len, source);
        } else {
            store(cache, resolved.path, body.clone()).await;
        }

        Ok(ProxyResponse {
            body,
            cache_status: CacheStatus::Miss,
        })
    }
}

/// Writes `body` to the cache, logging failures.
async fn store(cache: &TierCache, path: PathBuf, body: Bytes) {
    let cache = cache.clone();
    let result = tokio::task::spawn_blocking(move || {
        let result = cache.write(&path, &body);
        (path, result)
    })
    .await;

    match result {
        Ok((_, Ok(()))) => {
            metric!(counter("proxy.cache.write") += 1, "status" => "ok");
        }
        Ok((path, Err(e))) => {
            metric!(counter("proxy.cache.write") += 1, "status" => "error");
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || tracing::error!("Failed to cache data: {}", e),
            );
        }
        Err(e) => {
            metric!(counter("proxy.cache.write") += 1, "status" => "error");
            tracing::error!("Failed to cache data: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use dlcache_test::HitCounter;
    use filetime::FileTime;
    use reqwest::StatusCode;

    use super::*;
    use crate::policy::PolicyEntry;

    fn config(cache_dir: &Path, policies: Vec<PolicyEntry>) -> Config {
        Config {
            cache_dir: cache_dir.to_owned(),
            bandwidth_file: cache_dir.join("saved.txt"),
            policies,
            ..Config::default()
        }
    }

    /// A service that allows everything on `server` with the given policy settings.
    fn service(server: &HitCounter, cache_dir: &Path, long: bool, min_valid: u64) -> ProxyService {
        let policies = vec![PolicyEntry::new(server.prefix(), long, min_valid)];
        ProxyService::create(&config(cache_dir, policies)).unwrap()
    }

    fn target(server: &HitCounter, path: &str) -> String {
        server.url(path).to_string()
    }

    fn cached_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().path().is_file())
            .count()
    }

    #[tokio::test]
    async fn test_forbidden_never_fetches() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service =
            ProxyService::create(&config(cache_dir.path(), PolicyEntry::factorio_defaults()))
                .unwrap();

        let result = service.fetch(&target(&server, "/file/1000")).await;
        assert_eq!(result.unwrap_err(), ProxyError::Forbidden);

        let result = service.fetch("").await;
        assert_eq!(result.unwrap_err(), ProxyError::Forbidden);

        assert_eq!(server.accesses(), 0);
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);

        let response = service.fetch(&target(&server, "/file/1000")).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Miss);
        assert_eq!(response.body, dlcache_test::file_contents(1000));

        let response = service.fetch(&target(&server, "/file/1000")).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Hit);
        assert_eq!(response.body, dlcache_test::file_contents(1000));

        assert_eq!(server.hits("/file/1000"), 1);
        assert_eq!(service.bandwidth().total(), 1000);
        assert_eq!(cached_files(&cache_dir.path().join("short")), 1);
        assert_eq!(cached_files(&cache_dir.path().join("long")), 0);
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn test_long_term_tier() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), true, 0);

        let resolved = service.resolve(&target(&server, "/file/200")).unwrap();
        assert_eq!(resolved.tier, CacheTier::Long);
        assert!(resolved.path.starts_with(cache_dir.path().join("long")));
        assert!(resolved.path.ends_with(resolved.key.file_name()));

        service.fetch(&target(&server, "/file/200")).await.unwrap();
        assert!(resolved.path.is_file());
        assert_eq!(std::fs::read(&resolved.path).unwrap(), dlcache_test::file_contents(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_collapse() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);
        let target = target(&server, "/delay/100ms/file/1000");

        let requests = (0..8).map(|_| {
            let service = service.clone();
            let target = target.clone();
            tokio::spawn(async move { service.fetch(&target).await })
        });
        let responses = futures::future::join_all(requests).await;

        let mut misses = 0;
        for response in responses {
            let response = response.unwrap().unwrap();
            assert_eq!(response.body.len(), 1000);
            if response.cache_status == CacheStatus::Miss {
                misses += 1;
            }
        }

        assert_eq!(misses, 1);
        assert_eq!(server.hits("/delay/100ms/file/1000"), 1);
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn test_validation_thresholds() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 500);

        // `len > min_valid_size` is required, equality is not enough.
        for _ in 0..2 {
            let response = service.fetch(&target(&server, "/file/500")).await.unwrap();
            assert_eq!(response.cache_status, CacheStatus::Miss);
            assert_eq!(response.body.len(), 500);
        }
        assert_eq!(server.hits("/file/500"), 2);

        service.fetch(&target(&server, "/file/501")).await.unwrap();
        let response = service.fetch(&target(&server, "/file/501")).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Hit);
        assert_eq!(server.hits("/file/501"), 1);
    }

    #[tokio::test]
    async fn test_min_cache_size() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);

        // The global minimum of 100 bytes is inclusive.
        for _ in 0..2 {
            let response = service.fetch(&target(&server, "/file/99")).await.unwrap();
            assert_eq!(response.cache_status, CacheStatus::Miss);
        }
        assert_eq!(server.hits("/file/99"), 2);

        service.fetch(&target(&server, "/file/100")).await.unwrap();
        let response = service.fetch(&target(&server, "/file/100")).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Hit);

        // Empty bodies are never cached.
        let response = service.fetch(&target(&server, "/file/0")).await.unwrap();
        assert!(response.body.is_empty());
        assert_eq!(cached_files(&cache_dir.path().join("short")), 1);
    }

    #[tokio::test]
    async fn test_bad_status_not_cached() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);

        for _ in 0..2 {
            let err = service
                .fetch(&target(&server, "/status/500"))
                .await
                .unwrap_err();
            assert_eq!(
                err,
                ProxyError::OriginBadStatus(StatusCode::INTERNAL_SERVER_ERROR)
            );
        }

        assert_eq!(server.hits("/status/500"), 2);
        assert_eq!(cached_files(&cache_dir.path().join("short")), 0);
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn test_timeout() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let policies = vec![PolicyEntry::new(server.prefix(), false, 0)];
        let config = Config {
            max_download_timeout: Duration::from_millis(200),
            ..config(cache_dir.path(), policies)
        };
        let service = ProxyService::create(&config).unwrap();

        let err = service
            .fetch(&target(&server, "/delay/2s/file/200"))
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::OriginTimeout(Duration::from_millis(200)));
        assert_eq!(cached_files(&cache_dir.path().join("short")), 0);
    }

    #[tokio::test]
    async fn test_unreachable() {
        dlcache_test::setup();
        let cache_dir = dlcache_test::tempdir();
        let policies = vec![PolicyEntry::new("127.0.0.1:1/", false, 0)];
        let service = ProxyService::create(&config(cache_dir.path(), policies)).unwrap();

        let err = service
            .fetch("http://127.0.0.1:1/file/100")
            .await
            .unwrap_err();
        assert!(
            matches!(err, ProxyError::OriginUnreachable(_)),
            "unexpected error: {err:?}"
        );
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_not_cached() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);

        let err = service
            .fetch(&target(&server, "/truncated"))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ProxyError::OriginTruncated { .. } | ProxyError::OriginRead(_)
            ),
            "unexpected error: {err:?}"
        );
        assert_eq!(cached_files(&cache_dir.path().join("short")), 0);
    }

    #[tokio::test]
    async fn test_query_changes_key() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);

        let a = service.resolve(&target(&server, "/file/300?x=1")).unwrap();
        let b = service.resolve(&target(&server, "/file/300?x=2")).unwrap();
        assert_ne!(a.key, b.key);
        assert_ne!(a.path, b.path);

        service.fetch(&target(&server, "/file/300?x=1")).await.unwrap();
        service.fetch(&target(&server, "/file/300?x=2")).await.unwrap();
        let response = service.fetch(&target(&server, "/file/300?x=1")).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Hit);

        assert_eq!(server.hits("/file/300?x=1"), 1);
        assert_eq!(server.hits("/file/300?x=2"), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);

        let resolved = service.resolve(&target(&server, "/file/1000")).unwrap();
        service.fetch(&target(&server, "/file/1000")).await.unwrap();

        // The default short tier TTL is 10 minutes.
        let mtime = SystemTime::now() - Duration::from_secs(11 * 60);
        filetime::set_file_mtime(&resolved.path, FileTime::from_system_time(mtime)).unwrap();

        let response = service.fetch(&target(&server, "/file/1000")).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Miss);
        assert_eq!(server.hits("/file/1000"), 2);

        // The new download replaced the expired file.
        let response = service.fetch(&target(&server, "/file/1000")).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn test_swept_entry_is_refetched() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);
        let sweeper = service.sweeper();

        let resolved = service.resolve(&target(&server, "/file/1000")).unwrap();
        service.fetch(&target(&server, "/file/1000")).await.unwrap();

        let mtime = SystemTime::now() - Duration::from_secs(11 * 60);
        filetime::set_file_mtime(&resolved.path, FileTime::from_system_time(mtime)).unwrap();

        let stats = sweeper.run_pass(CacheTier::Short).await.unwrap();
        assert_eq!(stats.removed_files, 1);
        assert!(!resolved.path.exists());

        let response = service.fetch(&target(&server, "/file/1000")).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Miss);
        assert_eq!(server.hits("/file/1000"), 2);
        assert!(resolved.path.is_file());
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn test_young_entry_survives_sweeps() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), true, 0);
        let sweeper = service.sweeper();

        service.fetch(&target(&server, "/file/1000")).await.unwrap();

        for _ in 0..5 {
            for tier in CacheTier::ALL {
                let stats = sweeper.run_pass(tier).await.unwrap();
                assert_eq!(stats.removed_files, 0);
            }

            let response = service.fetch(&target(&server, "/file/1000")).await.unwrap();
            assert_eq!(response.cache_status, CacheStatus::Hit);
        }

        assert_eq!(server.hits("/file/1000"), 1);
        assert_eq!(cached_files(&cache_dir.path().join("long")), 1);
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_refetched() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);

        // A directory in place of the cache file can't be read, nor replaced.
        let resolved = service.resolve(&target(&server, "/file/1000")).unwrap();
        std::fs::create_dir(&resolved.path).unwrap();

        let response = service.fetch(&target(&server, "/file/1000")).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Miss);
        assert_eq!(response.body.len(), 1000);
    }

    #[tokio::test]
    async fn test_sweeper_shares_state() {
        dlcache_test::setup();
        let server = HitCounter::new();
        let cache_dir = dlcache_test::tempdir();
        let service = service(&server, cache_dir.path(), false, 0);

        service.fetch(&target(&server, "/file/1000")).await.unwrap();
        service.fetch(&target(&server, "/file/1000")).await.unwrap();

        let stats = service.sweeper().run_pass(CacheTier::Short).await.unwrap();
        assert_eq!(stats.retained_files, 1);
        assert_eq!(stats.removed_files, 0);

        // The short tier pass persists the bandwidth counter.
        let saved = std::fs::read_to_string(cache_dir.path().join("saved.txt")).unwrap();
        assert_eq!(saved, "1000");
    }
}
