use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bandwidth::BandwidthCounter;
use crate::config::Config;

use super::{CacheKey, CacheLocks, CacheTier, Caches, TierCache};

/// `tokio::time::interval` panics on a zero period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Entry function for the cleanup command.
///
/// This runs a single sweep over every tier. If `dry_run` is `true`, no files will actually be
/// deleted.
pub async fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    let caches = Caches::from_config(&config)?;
    let locks = CacheLocks::new();
    let strategy = DirectoryScan { dry_run };

    // Attempt to clean up all tiers, even if one of them fails.
    let mut first_error = None;
    for tier in CacheTier::ALL {
        if let Err(err) = sweep_tier(&strategy, caches.tier(tier), &locks).await {
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(stderr, "Failed to cleanup cache");
            first_error.get_or_insert(err);
        }
    }

    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Statistics of a single sweep over a tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// Removes expired files from a cache tier.
///
/// Implementations must hold the per-key lock from `locks` while deleting a cache file, so that
/// files are never removed while a request is reading or writing them.
pub trait ExpirySweep: fmt::Debug + Send + Sync {
    fn sweep<'a>(
        &'a self,
        cache: &'a TierCache,
        locks: &'a CacheLocks,
    ) -> BoxFuture<'a, io::Result<SweepStats>>;
}

/// Finds expired files by listing the tier directory.
///
/// Only files directly inside the tier directory are considered; directories are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryScan {
    /// Count the files that would be removed, without removing them.
    pub dry_run: bool,
}

impl ExpirySweep for DirectoryScan {
    fn sweep<'a>(
        &'a self,
        cache: &'a TierCache,
        locks: &'a CacheLocks,
    ) -> BoxFuture<'a, io::Result<SweepStats>> {
        Box::pin(self.scan(cache, locks))
    }
}

impl DirectoryScan {
    async fn scan(&self, cache: &TierCache, locks: &CacheLocks) -> io::Result<SweepStats> {
        let directory = cache.cache_dir();
        let mut stats = SweepStats::default();

        let mut entries = match tokio::fs::read_dir(directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(stats);
            }
            Err(e) => return Err(e),
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Err(e) = self.try_cleanup_path(cache, locks, &path, &mut stats).await {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to clean cache file: {:?}", e),
                );
            }
        }

        Ok(stats)
    }

    /// Removes the file at `path` if it is expired.
    async fn try_cleanup_path(
        &self,
        cache: &TierCache,
        locks: &CacheLocks,
        path: &Path,
        stats: &mut SweepStats,
    ) -> io::Result<()> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = file_metadata(path).await? else {
            return Ok(());
        };
        if metadata.is_dir() {
            tracing::debug!("Skipping directory `{}`", path.display());
            return Ok(());
        }

        let size = metadata.len();
        if !cache.is_expired(metadata.modified()?) {
            stats.retained_files += 1;
            stats.retained_bytes += size;
            return Ok(());
        }

        let key = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(CacheKey::from_file_name);

        // Anything that is not a cache key can't be in use by a request.
        let _guard = match &key {
            Some(key) => Some(locks.acquire(key).await),
            None => None,
        };

        // The file may have been rewritten or removed while we waited for the lock.
        let Some(metadata) = file_metadata(path).await? else {
            return Ok(());
        };
        if !cache.is_expired(metadata.modified()?) {
            stats.retained_files += 1;
            stats.retained_bytes += metadata.len();
            return Ok(());
        }

        tracing::debug!("Removing file `{}`", path.display());
        if !self.dry_run {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        stats.removed_files += 1;
        stats.removed_bytes += metadata.len();
        Ok(())
    }
}

/// Like [`tokio::fs::symlink_metadata`], but a missing file is `None`.
async fn file_metadata(path: &Path) -> io::Result<Option<std::fs::Metadata>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn sweep_tier(
    strategy: &dyn ExpirySweep,
    cache: &TierCache,
    locks: &CacheLocks,
) -> io::Result<SweepStats> {
    let tier = cache.tier();
    tracing::info!("Cleaning up `{}` cache", tier);

    let stats = strategy.sweep(cache, locks).await?;

    tracing::info!("Cleaning up `{}` complete", tier);
    tracing::info!(
        "Retained {} files, totaling {} bytes",
        stats.retained_files,
        stats.retained_bytes,
    );
    tracing::info!(
        "Removed {} files, totaling {} bytes",
        stats.removed_files,
        stats.removed_bytes
    );

    metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => tier.as_ref());
    metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => tier.as_ref());
    metric!(counter("caches.size.files_removed") += stats.removed_files as i64, "cache" => tier.as_ref());
    metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64, "cache" => tier.as_ref());

    Ok(stats)
}

/// Periodically sweeps the cache tiers while the proxy is running.
#[derive(Debug, Clone)]
pub struct Sweeper {
    caches: Arc<Caches>,
    locks: CacheLocks,
    bandwidth: Arc<BandwidthCounter>,
    strategy: Arc<dyn ExpirySweep>,
}

impl Sweeper {
    pub fn new(caches: Arc<Caches>, locks: CacheLocks, bandwidth: Arc<BandwidthCounter>) -> Self {
        Self {
            caches,
            locks,
            bandwidth,
            strategy: Arc::new(DirectoryScan::default()),
        }
    }

    /// Replaces the default [`DirectoryScan`].
    pub fn with_strategy(mut self, strategy: Arc<dyn ExpirySweep>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Runs a single sweep over `tier`.
    ///
    /// Sweeping the short tier also persists the bandwidth counter, so the counter file is
    /// updated as often as the most frequent sweep.
    pub async fn run_pass(&self, tier: CacheTier) -> io::Result<SweepStats> {
        if tier == CacheTier::Short {
            match self.bandwidth.flush() {
                Ok(true) => tracing::debug!("Saved bandwidth counter: {}", self.bandwidth.total()),
                Ok(false) => {}
                Err(e) => tracing::error!("Failed to save bandwidth counter: {}", e),
            }
        }

        sweep_tier(&*self.strategy, self.caches.tier(tier), &self.locks).await
    }

    /// Spawns one sweep loop per tier.
    ///
    /// The first pass of each loop runs immediately. Passes never overlap; a pass that takes
    /// longer than the interval delays the next one.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        CacheTier::ALL
            .into_iter()
            .map(|tier| {
                let sweeper = self.clone();
                let period = sweeper
                    .caches
                    .tier(tier)
                    .sweep_interval()
                    .max(MIN_SWEEP_INTERVAL);

                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        if let Err(e) = sweeper.run_pass(tier).await {
                            let stderr: &dyn std::error::Error = &e;
                            tracing::error!(stderr, "Failed to sweep `{}` cache", tier);
                        }
                    }
                })
            })
            .collect()
    }
}
