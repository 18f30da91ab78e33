use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The suffix of every cache file name.
pub const CACHE_SUFFIX: &str = ".cache";

/// Length of a hex-encoded SHA-256 digest.
const HASH_LEN: usize = 64;

/// Identifies a cache entry, and doubles as its file name.
///
/// Two keys are equal exactly when their file names are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    file_name: Arc<str>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name)
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for the given URL.
    ///
    /// The URL is hashed as-is, so URLs that differ only in their query string get different keys.
    pub fn from_url(url: &str) -> Self {
        let hash = Sha256::digest(url.as_bytes());
        let mut file_name = hex::encode(hash);
        file_name.push_str(CACHE_SUFFIX);

        Self {
            file_name: file_name.into(),
        }
    }

    /// Reconstructs the key of an existing cache file from its file name.
    ///
    /// Returns `None` for names that [`from_url`](Self::from_url) can not produce.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let hash = name.strip_suffix(CACHE_SUFFIX)?;
        let is_hash = hash.len() == HASH_LEN
            && hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        is_hash.then(|| Self {
            file_name: name.into(),
        })
    }

    /// The file name of the cache entry, relative to its tier directory.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}
