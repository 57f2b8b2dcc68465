//! Configuration layer: typed settings with layered precedence (file → env).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG_BASENAME: &str = "spurgo";
const ENV_PREFIX: &str = "SPURGO";

const DEFAULT_MAX_ATTEMPTS: i64 = 3;
const DEFAULT_EXPAND_BATCH: i64 = 20;
const DEFAULT_PURGE_BATCH: i64 = 50;
const DEFAULT_URL_DRAIN_PASSES: u32 = 3;
const DEFAULT_GC_RETENTION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_STALE_RESERVATION_SECS: u64 = 10 * 60;
const DEFAULT_DB_URL: &str = "sqlite:spurgo.db";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration could not be loaded: {0}")]
    Load(#[from] config::ConfigError),
}

/// Whether content changes purge through the queue or inline in the
/// triggering request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeMode {
    /// Enqueue and let the scheduled drains do the work.
    Queued,
    /// Expand and call the purge client synchronously. For low-traffic
    /// sites without a scheduler.
    Immediate,
}

/// What an immediate-mode purge failure does to the triggering call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnImmediateFailure {
    /// Log and let the original request proceed (fail open).
    LogOnly,
    /// Propagate the error to the caller.
    SurfaceToCaller,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

/// Purge-pipeline tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PurgeSettings {
    pub mode: PurgeMode,
    /// Processing attempts before an item is flagged failed.
    pub max_attempts: i64,
    /// Object-queue items expanded per drain trigger.
    pub expand_batch: i64,
    /// URL-queue items sent to the purge client per batch.
    pub purge_batch: i64,
    /// Internal passes one URL-drain trigger may run.
    pub url_drain_passes: u32,
    /// Also purge day/month/year archives.
    pub purge_date_archives: bool,
    /// Emit cache-tags instead of enumerating URLs.
    pub tag_mode: bool,
    /// How long terminal items are kept before garbage collection.
    pub gc_retention_secs: u64,
    /// Reservations older than this are released by garbage collection.
    pub stale_reservation_secs: u64,
    pub on_immediate_failure: OnImmediateFailure,
}

impl Default for PurgeSettings {
    fn default() -> Self {
        Self {
            mode: PurgeMode::Queued,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            expand_batch: DEFAULT_EXPAND_BATCH,
            purge_batch: DEFAULT_PURGE_BATCH,
            url_drain_passes: DEFAULT_URL_DRAIN_PASSES,
            purge_date_archives: false,
            tag_mode: false,
            gc_retention_secs: DEFAULT_GC_RETENTION_SECS,
            stale_reservation_secs: DEFAULT_STALE_RESERVATION_SECS,
            on_immediate_failure: OnImmediateFailure::LogOnly,
        }
    }
}

impl PurgeSettings {
    pub fn gc_retention(&self) -> Duration {
        Duration::from_secs(self.gc_retention_secs)
    }

    pub fn stale_reservation(&self) -> Duration {
        Duration::from_secs(self.stale_reservation_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_DB_URL.to_string(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Tracing filter directive, e.g. `info` or `spurgo=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Root settings document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub purge: PurgeSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from an optional file layered under `SPURGO_*`
    /// environment overrides (`SPURGO_PURGE__MAX_ATTEMPTS=5`).
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        builder = match config_file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false)),
        };
        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
