//! Keeps track of how many bytes were served from the cache instead of the origin.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tempfile::NamedTempFile;

/// A process-wide counter of bytes served from the cache.
///
/// The counter is persisted as a single decimal integer. Persisting is best effort: it happens
/// during the short tier sweep and on shutdown, so a crash loses at most the bytes counted since
/// the last sweep.
#[derive(Debug)]
pub struct BandwidthCounter {
    saved: AtomicU64,
    dirty: AtomicBool,
    path: PathBuf,
}

impl BandwidthCounter {
    /// Creates a counter that starts at zero and is persisted to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_total(path.into(), 0)
    }

    fn with_total(path: PathBuf, total: u64) -> Self {
        Self {
            saved: AtomicU64::new(total),
            dirty: AtomicBool::new(false),
            path,
        }
    }

    /// Loads the counter from `path`.
    ///
    /// A missing or malformed file starts the counter at zero.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let total = match std::fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<u64>() {
                Ok(total) => total,
                Err(e) => {
                    tracing::warn!(
                        "Invalid bandwidth counter in `{}`, starting at 0: {}",
                        path.display(),
                        e
                    );
                    0
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                tracing::warn!(
                    "Failed to read bandwidth counter from `{}`, starting at 0: {}",
                    path.display(),
                    e
                );
                0
            }
        };

        tracing::info!("Bandwidth saved so far: {} bytes", total);
        Self::with_total(path, total)
    }

    /// Adds `bytes` served from the cache.
    pub fn record(&self, bytes: u64) {
        self.saved.fetch_add(bytes, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        metric!(counter("bandwidth.saved") += bytes as i64);
    }

    pub fn total(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    /// Persists the counter if it changed since the last flush.
    ///
    /// Returns whether the file was written. The file is replaced atomically, so a reader never
    /// sees a partial number.
    pub fn flush(&self) -> io::Result<bool> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let result = self.write_total(self.total());
        if result.is_err() {
            // Try again on the next flush.
            self.dirty.store(true, Ordering::Release);
        }
        result.map(|_| true)
    }

    fn write_total(&self, total: u64) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut file = NamedTempFile::new_in(dir)?;
        write!(file, "{total}")?;
        file.flush()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
