//! The origin allowlist.
//!
//! Every request target is matched against an ordered list of [`PolicyEntry`]s. Only targets that
//! start with one of the configured prefixes are ever fetched, and the matched entry decides which
//! cache tier the response goes to and how large a response needs to be to be trusted.

use serde::Deserialize;
use url::Url;

use crate::caching::CacheTier;

/// A single allowlist rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyEntry {
    /// The URL prefix, without scheme and without a leading `www.`.
    pub prefix: String,
    /// Whether matching responses are stored in the long-lived cache tier.
    #[serde(default)]
    pub long_term_cache: bool,
    /// Responses must be strictly larger than this to be cached.
    #[serde(default)]
    pub min_valid_size: u64,
}

impl PolicyEntry {
    pub fn new(prefix: impl Into<String>, long_term_cache: bool, min_valid_size: u64) -> Self {
        Self {
            prefix: prefix.into(),
            long_term_cache,
            min_valid_size,
        }
    }

    /// The Factorio download and mod portal endpoints.
    pub fn factorio_defaults() -> Vec<Self> {
        let kib = 1024;
        vec![
            // game downloads
            Self::new("factorio.com/get-download", false, 50 * kib * kib),
            Self::new("factorio.com/download/sha256sums", false, 100 * kib),
            // mod downloads never change for a given version
            Self::new("mods.factorio.com/download", true, 5 * kib),
            // JSON APIs
            Self::new("factorio.com/api/latest-releases", false, 100),
            Self::new("mods.factorio.com/api/mods", false, 500),
        ]
    }
}

/// The outcome of matching a request target against the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub allowed: bool,
    pub long_term_cache: bool,
    pub min_valid_size: u64,
}

impl Classification {
    const DENIED: Self = Self {
        allowed: false,
        long_term_cache: false,
        min_valid_size: 0,
    };

    /// The cache tier responses for this target are stored in.
    pub fn tier(&self) -> CacheTier {
        if self.long_term_cache {
            CacheTier::Long
        } else {
            CacheTier::Short
        }
    }
}

impl From<&PolicyEntry> for Classification {
    fn from(entry: &PolicyEntry) -> Self {
        Self {
            allowed: true,
            long_term_cache: entry.long_term_cache,
            min_valid_size: entry.min_valid_size,
        }
    }
}

/// The ordered, immutable allowlist.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: Vec<PolicyEntry>,
}

impl PolicyTable {
    pub fn new(entries: Vec<PolicyEntry>) -> Self {
        // An empty prefix would match everything.
        let entries = entries
            .into_iter()
            .filter(|entry| {
                let keep = !entry.prefix.is_empty();
                if !keep {
                    tracing::warn!("Ignoring allowlist entry with an empty prefix");
                }
                keep
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[PolicyEntry] {
        &self.entries
    }

    /// Matches the decoded request target, without its leading slash, against the allowlist.
    pub fn classify(&self, path: &str) -> Classification {
        let normalized = strip_scheme(path);
        if normalized.is_empty() {
            return Classification::DENIED;
        }

        match self.find(normalized) {
            Some(entry) => entry.into(),
            None => {
                tracing::debug!("Not in allowlist: {}", crate::utils::redact_query(normalized));
                Classification::DENIED
            }
        }
    }

    fn find(&self, normalized: &str) -> Option<&PolicyEntry> {
        self.entries
            .iter()
            .find(|entry| normalized.starts_with(entry.prefix.as_str()))
    }

    /// Turns an allowlisted target into the absolute URL that is fetched from the origin.
    ///
    /// Targets without a scheme are fetched via `https`. The parsed URL must still match the
    /// same prefix, so that nothing the URL parser normalizes (userinfo, a different authority)
    /// can redirect the fetch to a host outside of the allowlist.
    pub fn resolve_url(&self, path: &str) -> Option<Url> {
        let absolute = if path.starts_with("https://") || path.starts_with("http://") {
            path.to_owned()
        } else {
            format!("https://{path}")
        };

        let url = Url::parse(&absolute).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        if !url.username().is_empty() || url.password().is_some() {
            return None;
        }

        let host = url.host_str()?;
        let host = host.strip_prefix("www.").unwrap_or(host);

        let mut normalized = host.to_owned();
        if let Some(port) = url.port() {
            normalized.push_str(&format!(":{port}"));
        }
        normalized.push_str(url.path());
        if let Some(query) = url.query() {
            normalized.push('?');
            normalized.push_str(query);
        }

        // Only compare against the entry the raw target matched, a different entry would imply
        // a different tier.
        let expected = self.find(strip_scheme(path))?;
        normalized
            .starts_with(expected.prefix.as_str())
            .then_some(url)
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new(PolicyEntry::factorio_defaults())
    }
}

/// Strips a leading `https://` or `http://`, followed by a leading `www.`.
fn strip_scheme(path: &str) -> &str {
    let path = path
        .strip_prefix("https://")
        .or_else(|| path.strip_prefix("http://"))
        .unwrap_or(path);
    path.strip_prefix("www.").unwrap_or(path)
}
