use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tempfile::NamedTempFile;

use crate::config::{Config, TierConfig};

use super::{CacheKey, CacheTier, PathEscapeError, safe_join};

/// A single cache tier on the file system.
#[derive(Debug, Clone)]
pub struct TierCache {
    /// Cache identifier used for metric names.
    tier: CacheTier,

    /// Directory holding the cache files of this tier. Will be created if it does not exist.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// New files are written to a temporary file in this sibling directory, and once fully
    /// written atomically moved to their location within [`cache_dir`](Self::cache_dir).
    tmp_dir: PathBuf,

    config: TierConfig,
}

impl TierCache {
    /// Creates the tier directory.
    ///
    /// Both directories are made absolute here, so that cache paths do not depend on the working
    /// directory of later requests.
    pub fn from_config(tier: CacheTier, config: &Config, tier_config: TierConfig) -> io::Result<Self> {
        let cache_dir = std::path::absolute(config.cache_dir(tier.as_ref()))?;
        let tmp_dir = std::path::absolute(config.cache_dir("tmp"))?;
        std::fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            tier,
            cache_dir,
            tmp_dir,
            config: tier_config,
        })
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }

    /// The location of the cache file for `key` within this tier.
    pub fn path_for(&self, key: &CacheKey) -> Result<PathBuf, PathEscapeError> {
        safe_join(&self.cache_dir, key.file_name())
    }

    /// Whether a file last modified at `mtime` has outlived the TTL.
    ///
    /// Files from the future are never expired.
    pub fn is_expired(&self, mtime: SystemTime) -> bool {
        match SystemTime::now().duration_since(mtime) {
            Ok(age) => age > self.config.ttl,
            Err(_) => false,
        }
    }

    /// Reads the whole cache file at `path`.
    ///
    /// Returns `Ok(None)` if there is no such file, or if it is expired and merely waiting for
    /// the next sweep.
    pub async fn read(&self, path: &Path) -> io::Result<Option<Bytes>> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        tracing::trace!("File `{}` length: {}", path.display(), metadata.len());

        if self.is_expired(metadata.modified()?) {
            tracing::trace!("File `{}` is expired", path.display());
            return Ok(None);
        }

        match tokio::fs::read(path).await {
            Ok(contents) => Ok(Some(Bytes::from(contents))),
            // Swept in between.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically replaces the cache file at `path` with `contents`.
    ///
    /// This does blocking I/O and should be called through `spawn_blocking`.
    pub fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = self.tempfile()?;
        file.write_all(contents)?;
        file.flush()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        file.persist(path).map_err(|e| e.error)?;

        tracing::trace!("Wrote {} bytes to `{}`", contents.len(), path.display());
        Ok(())
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        let path = &self.tmp_dir;
        // The tmp directory is cleared on startup, and could be removed by an operator at any
        // time, so be defensive here and retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(path) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}
