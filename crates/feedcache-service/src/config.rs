use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

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
    /// The log level for feedcache.
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "feedcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Whether the currently active item takes part in prefetching.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveItemPolicy {
    /// The active item is streamed directly from the origin.
    ///
    /// It is never newly requested while it is active. A copy that is already resident or in
    /// flight is retained, so that re-entering the item is instant.
    #[default]
    Stream,
    /// The active item is fetched like any other window item, at the highest priority.
    Cache,
}

/// Shape and resource bounds of the prefetch window.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Number of items after the active one that should be resident.
    pub forward_count: usize,
    /// Number of items before the active one that should be resident.
    pub backward_count: usize,
    /// The fixed number of downloads that may run at the same time.
    pub max_concurrent_downloads: usize,
    /// Soft upper bound for the bytes held by resident entries.
    pub cache_budget_bytes: u64,
    /// Break priority ties at equal distance by the direction of travel.
    ///
    /// When disabled, items ahead of the active one always win ties.
    pub direction_weighting: bool,
    /// How the active item is treated.
    pub active_item: ActiveItemPolicy,
    /// Number of consecutive storage failures after which prefetching is disabled.
    pub max_storage_failures: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            forward_count: 3,
            backward_count: 1,
            max_concurrent_downloads: 3,
            cache_budget_bytes: 512 * 1024 * 1024,
            direction_weighting: true,
            active_item: ActiveItemPolicy::Stream,
            max_storage_failures: 3,
        }
    }
}

/// See the README for more information on config values.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for cached media. Leaving this empty disables prefetching.
    pub cache_dir: Option<PathBuf>,

    /// Wipe the cache directory when the controller is created.
    ///
    /// The cache is session-scoped, no manifest is kept across restarts.
    pub clear_on_start: bool,

    /// Configuration of the prefetch window and its resource bounds.
    pub prefetch: PrefetchConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<String>,

    /// The maximum timeout for a single media download.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The timeout for establishing a connection to the media origin.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving the response headers of a download.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> Option<PathBuf> {
    Some(env::temp_dir().join("feedcache"))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            clear_on_start: true,
            prefetch: PrefetchConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            // Short clips are a few MB, a minute is plenty even on a slow mobile link.
            max_download_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(2),
            head_timeout: Duration::from_secs(5),
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
    fn test_prefetch_config() {
        // Individual options can be set without affecting the other defaults.
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.prefetch, PrefetchConfig::default());

        let yaml = r#"
            prefetch:
              forward_count: 5
              active_item: cache
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.prefetch.forward_count, 5);
        assert_eq!(cfg.prefetch.active_item, ActiveItemPolicy::Cache);
        assert_eq!(cfg.prefetch.backward_count, 1);
        assert_eq!(cfg.prefetch.max_concurrent_downloads, 3);
        assert!(cfg.prefetch.direction_weighting);
    }

    #[test]
    fn test_download_timeouts() {
        let yaml = r#"
            max_download_timeout: 30s
            connect_timeout: 500ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let default_cfg = Config::default();
        assert_eq!(cfg.max_download_timeout, Duration::from_secs(30));
        assert_eq!(cfg.connect_timeout, Duration::from_millis(500));
        assert_eq!(cfg.head_timeout, default_cfg.head_timeout);
    }

    #[test]
    fn test_disabling_cache_dir() {
        let yaml = r#"
            cache_dir: null
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache_dir, None);
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            prefetch:
              not_an_option: 1
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let result = Config::from_reader("".as_bytes());
        assert!(result.is_err());
    }
}
