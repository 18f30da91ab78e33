//! # File-system caching
//!
//! Every allowlisted response that passes validation is stored as a single file holding the raw
//! response body. There is no metadata file; the file's `mtime` is the only staleness signal.
//!
//! ## Tiers
//!
//! Files live in one of two [`CacheTier`]s, `short` and `long`, each with its own directory below
//! [`Config::cache_dir`], its own time-to-live and its own sweep interval. The tier of a file is
//! decided by the allowlist entry that matched its URL and never changes.
//!
//! ## [`CacheKey`]
//!
//! The file name of a cache entry is the hex-encoded SHA-256 of the full URL, including the query
//! string, followed by a `.cache` suffix. [`safe_join`] confines the file name to its tier
//! directory.
//!
//! ## Writing
//!
//! Files are written into a [`NamedTempFile`](tempfile::NamedTempFile) in the `tmp` directory
//! next to the tiers, and then atomically renamed into place. Readers thus either see the
//! complete previous file, the complete new file, or nothing. The `tmp` directory is cleared on
//! startup, see [`Caches::clear_tmp`].
//!
//! ## Locking
//!
//! Both the request path and the expiry sweep take the per-key lock from [`CacheLocks`] before
//! touching a cache file. This is what collapses concurrent requests for the same URL into a
//! single origin fetch, and what keeps the sweep from deleting a file that is being served.
//!
//! ## Expiry
//!
//! A [`Sweeper`] periodically runs an [`ExpirySweep`] over each tier. The default
//! [`DirectoryScan`] walks the tier directory and deletes every file older than the tier's TTL.
//!
//! [`Config::cache_dir`]: crate::config::Config::cache_dir

use std::io;
use std::path::{Path, PathBuf};

use crate::config::Config;

mod cache_key;
mod cleanup;
mod config;
mod fs;
mod locks;
mod paths;

pub use cache_key::{CACHE_SUFFIX, CacheKey};
pub use cleanup::{DirectoryScan, ExpirySweep, SweepStats, Sweeper, cleanup};
pub use config::CacheTier;
pub use fs::TierCache;
pub use locks::{CacheLockGuard, CacheLocks};
pub use paths::{PathEscapeError, safe_join};

/// All the cache tiers, plus the shared temporary directory.
#[derive(Debug)]
pub struct Caches {
    /// Frequently changing responses.
    pub short: TierCache,
    /// Immutable downloads.
    pub long: TierCache,
    tmp_dir: PathBuf,
}

impl Caches {
    /// Creates the tier and temporary directories.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let tmp_dir = std::path::absolute(config.cache_dir("tmp"))?;
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            short: TierCache::from_config(CacheTier::Short, config, config.caches.short)?,
            long: TierCache::from_config(CacheTier::Long, config, config.caches.long)?,
            tmp_dir,
        })
    }

    pub fn tier(&self, tier: CacheTier) -> &TierCache {
        match tier {
            CacheTier::Short => &self.short,
            CacheTier::Long => &self.long,
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid accidentally leaving temporary files which survive
    /// a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)
    }
}
