use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
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
            prefix: "captivate".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Lifetimes and sizes of the in-memory caches.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a resolved feedback state is served without asking the remote again.
    ///
    /// A value of `0s` keeps entries until they are replaced or invalidated.
    #[serde(with = "humantime_serde")]
    pub feedback_ttl: Duration,

    /// Edge length in pixels of the square footprint all button images are normalized to.
    pub image_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            feedback_ttl: Duration::from_millis(250),
            image_size: 72,
        }
    }
}

/// Timings of the debounced background work.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Change notifications for the same feedback within this window are dropped.
    #[serde(with = "humantime_serde")]
    pub change_throttle: Duration,

    /// Delay of the reconciliation pass, re-armed by every miss or change.
    #[serde(with = "humantime_serde")]
    pub reconcile_delay: Duration,

    /// Delay of the registry refresh, re-armed by every registry change.
    #[serde(with = "humantime_serde")]
    pub registry_refresh_delay: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            change_throttle: Duration::from_millis(100),
            reconcile_delay: Duration::from_millis(500),
            registry_refresh_delay: Duration::from_secs(1),
        }
    }
}

/// Names of the stores queried on the remote application.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Key-value namespace holding the play state of every overlay layer.
    pub play_state_namespace: String,

    /// Image set used to seed the image cache on connect.
    pub image_set_group: String,

    /// Whether to fetch `image_set_group` when a session connects.
    pub prime_images: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            play_state_namespace: "newblue.automation.layerstate".into(),
            image_set_group: "automation.glow.base".into(),
            prime_images: true,
        }
    }
}

/// Timeouts for downloading images referenced by URL.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ImageDownloadConfig {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for the whole download, including the connect phase.
    #[serde(with = "humantime_serde")]
    pub download_timeout: Duration,
}

impl Default for ImageDownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            download_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Lifetimes of the feedback and image caches.
    pub caches: CacheConfig,

    /// Debounce and throttle timings.
    pub scheduling: SchedulingConfig,

    /// Remote store names.
    pub remote: RemoteConfig,

    /// Image download timeouts.
    pub images: ImageDownloadConfig,
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
        // serde_yaml turns an empty document into a confusing type error
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

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
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
