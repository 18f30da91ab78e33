use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::policy::PolicyEntry;
use crate::utils::http::DownloadTimeouts;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the proxy.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "dlcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Expiry settings of a single cache tier.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
pub struct TierConfig {
    /// Maximum age of a cache file, measured by its `mtime`.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How often the tier directory is swept for expired files.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl TierConfig {
    fn short() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }

    fn long() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 24 * 3600),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    /// The tier for frequently changing responses, like release listings.
    pub short: TierConfig,
    /// The tier for immutable downloads, like mod archives.
    pub long: TierConfig,
    /// Responses smaller than this are never written to the cache, regardless of policy.
    ///
    /// This catches empty bodies and tiny error pages that were served with status 200.
    pub min_cache_size: u64,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            short: TierConfig::short(),
            long: TierConfig::long(),
            min_cache_size: 100,
        }
    }
}

/// Token bucket settings for admission control.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens added to the bucket per second.
    pub per_second: u32,
    /// Capacity of the bucket.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 4,
            burst: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for the cache tiers and temporary files.
    pub cache_dir: PathBuf,

    /// File the total number of bytes served from cache is persisted to.
    pub bandwidth_file: PathBuf,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache expiry
    pub caches: CacheConfigs,

    /// The origin allowlist. Entries are matched in order, the first matching prefix wins.
    pub policies: Vec<PolicyEntry>,

    /// The timeout for establishing a connection to an origin.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum time a single origin download may take, including reading the body.
    ///
    /// The default allows a 1MB/s connection to download a ~600MB game release.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// Admission control for incoming requests.
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    pub fn cache_dir<P>(&self, dir: P) -> PathBuf
    where
        P: AsRef<Path>,
    {
        self.cache_dir.join(dir)
    }

    pub fn timeouts(&self) -> DownloadTimeouts {
        DownloadTimeouts {
            connect: self.connect_timeout,
            max_download: self.max_download_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("cache"),
            bandwidth_file: PathBuf::from("saved.txt"),
            bind: "127.0.0.1:55555".to_owned(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            policies: PolicyEntry::factorio_defaults(),
            connect_timeout: Duration::from_secs(5),
            max_download_timeout: Duration::from_secs(10 * 60),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
