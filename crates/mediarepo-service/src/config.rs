use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::level_filters::LevelFilter;

const MEBIBYTE: u64 = 1024 * 1024;

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
    /// The log level.
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
            prefix: "mediarepo".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Remote media downloads over federation.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadsConfig {
    /// Remote media larger than this are rejected as too large.
    ///
    /// Defaults to `100 MiB`.
    pub max_size_bytes: u64,

    /// The number of remote downloads that may run at the same time.
    pub num_workers: usize,

    /// How long a failed remote download is remembered.
    ///
    /// Requests for the same remote media fail fast with the remembered error during this time.
    #[serde(with = "humantime_serde")]
    pub failure_cache_duration: Duration,

    /// Origins that are served by this repository and never fetched over federation.
    pub local_origins: Vec<String>,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * MEBIBYTE,
            num_workers: 10,
            failure_cache_duration: Duration::from_secs(15 * 60),
            local_origins: Vec::new(),
        }
    }
}

/// Configuration of the in-memory adaptive content cache.
///
/// Every value here may be changed at runtime, see [`ContentCache::reconfigure`](crate::caching::ContentCache::reconfigure).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContentCacheConfig {
    /// Whether content is cached at all.
    pub enabled: bool,

    /// The aggregate byte budget of all cached items.
    ///
    /// Defaults to `1000 MiB`.
    pub max_size_bytes: u64,

    /// Items larger than this are never cached.
    ///
    /// Defaults to `100 MiB`.
    pub max_file_size_bytes: u64,

    /// The window over which downloads are counted.
    #[serde(with = "humantime_serde")]
    pub tracked_window: Duration,

    /// The number of downloads within the tracked window an item needs before it is cached.
    pub min_downloads: u64,

    /// How long a freshly admitted item is protected from demand-based eviction.
    #[serde(with = "humantime_serde")]
    pub min_cache_time: Duration,

    /// How long a freshly evicted item is kept from being admitted again.
    #[serde(with = "humantime_serde")]
    pub min_evicted_time: Duration,

    /// The interval of the background sweep that reclaims space from faded items.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: 1000 * MEBIBYTE,
            max_file_size_bytes: 100 * MEBIBYTE,
            tracked_window: Duration::from_secs(30 * 60),
            min_downloads: 5,
            min_cache_time: Duration::from_secs(5 * 60),
            min_evicted_time: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemRemoteCacheConfig {
    pub path: PathBuf,
}

/// The backend to use for the remote cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteCacheBackendConfig {
    Filesystem(FilesystemRemoteCacheConfig),
}

/// A write-through cache shared between repository instances.
///
/// When configured, it replaces the in-memory adaptive cache. Popularity is not tracked
/// locally, expiry is left to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCacheConfig {
    /// Reads and writes taking longer than this are abandoned and treated as a miss.
    #[serde(default = "default_remote_cache_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// The backend to use for the remote cache.
    #[serde(flatten)]
    pub backend: RemoteCacheBackendConfig,
}

fn default_remote_cache_timeout() -> Duration {
    Duration::from_secs(5)
}

/// A thumbnail size that requests are snapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ThumbnailsConfig {
    /// The number of thumbnails that may be generated at the same time.
    pub num_workers: usize,

    /// Source media larger than this are not thumbnailed.
    pub max_source_bytes: u64,

    /// The sizes thumbnails are generated in.
    pub sizes: Vec<ThumbnailSize>,
}

impl Default for ThumbnailsConfig {
    fn default() -> Self {
        let size = |width, height| ThumbnailSize { width, height };
        Self {
            num_workers: 10,
            max_source_bytes: 10 * MEBIBYTE,
            sizes: vec![
                size(32, 32),
                size(96, 96),
                size(320, 240),
                size(640, 480),
                size(800, 600),
            ],
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UrlPreviewsConfig {
    pub enabled: bool,

    /// The number of previews that may be generated at the same time.
    pub num_workers: usize,

    /// Pages larger than this are not previewed.
    pub max_page_size_bytes: u64,
}

impl Default for UrlPreviewsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_workers: 10,
            max_page_size_bytes: 10 * MEBIBYTE,
        }
    }
}

/// Tuning of request coalescing.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoalescingConfig {
    /// How long a finished computation is served to new callers before it is run again.
    #[serde(with = "humantime_serde")]
    pub result_grace_period: Duration,

    /// The number of chunks buffered per waiter when one stream is fanned out to many.
    ///
    /// Chunks are reference counted and shared between waiters, so this bounds the memory
    /// held on behalf of each waiter to this many upstream chunks.
    pub fanout_buffer_chunks: usize,

    /// A waiter whose buffer stays full this long is detached so the others can proceed.
    #[serde(with = "humantime_serde")]
    pub fanout_stall_timeout: Duration,
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            result_grace_period: Duration::from_secs(30),
            fanout_buffer_chunks: 16,
            fanout_stall_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Remote downloads.
    pub downloads: DownloadsConfig,

    /// The in-memory adaptive content cache.
    pub cache: ContentCacheConfig,

    /// An optional remote cache replacing the in-memory one.
    pub remote_cache: Option<RemoteCacheConfig>,

    pub thumbnails: ThumbnailsConfig,

    pub url_previews: UrlPreviewsConfig,

    pub coalescing: CoalescingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            downloads: DownloadsConfig::default(),
            cache: ContentCacheConfig::default(),
            remote_cache: None,
            thumbnails: ThumbnailsConfig::default(),
            url_previews: UrlPreviewsConfig::default(),
            coalescing: CoalescingConfig::default(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        // Individual values can be set in reasonable units without affecting the others.
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache, ContentCacheConfig::default());
        assert_eq!(cfg.cache.min_downloads, 5);

        let yaml = r#"
            cache:
              max_size_bytes: 2048
              tracked_window: 10m
              min_evicted_time: 2s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.max_size_bytes, 2048);
        assert_eq!(cfg.cache.tracked_window, Duration::from_secs(600));
        assert_eq!(cfg.cache.min_evicted_time, Duration::from_secs(2));
        assert_eq!(cfg.cache.min_cache_time, Duration::from_secs(300));
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.downloads, DownloadsConfig::default());
    }

    #[test]
    fn test_remote_cache() {
        let yaml = r#"
            remote_cache:
              filesystem:
                path: /tmp/mediarepo
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let remote = cfg.remote_cache.unwrap();
        assert_eq!(remote.timeout, Duration::from_secs(5));
        assert_eq!(
            remote.backend,
            RemoteCacheBackendConfig::Filesystem(FilesystemRemoteCacheConfig {
                path: PathBuf::from("/tmp/mediarepo"),
            })
        );
    }

    #[test]
    fn test_thumbnail_sizes() {
        let yaml = r#"
            thumbnails:
              sizes:
                - width: 64
                  height: 64
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.thumbnails.sizes,
            vec![ThumbnailSize {
                width: 64,
                height: 64
            }]
        );
        assert_eq!(cfg.thumbnails.num_workers, 10);
    }

    #[test]
    fn test_log_level() {
        let yaml = r#"
            logging:
              level: debug
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);

        let yaml = r#"
            logging:
              level: chatty
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_cache:
                max_unused_for: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
