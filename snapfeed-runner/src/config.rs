//! Pipeline configuration: a TOML file plus process environment.
//!
//! Everything is validated before the first cycle; any problem here is a
//! startup error and no cycle runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use snapfeed_core::fetch::http::DEFAULT_LIST_FIELD;
use snapfeed_core::{FetchError, RetryPolicy, Shard, ShardError, ShardMap, SystemClock};

use crate::archive::ArchiveNaming;
use crate::gate::{TradingWindow, WindowError};
use crate::store::StoreError;
use crate::upload::UploadError;

pub const ENV_STORE_URL: &str = "SNAPFEED_STORE_URL";
pub const ENV_UPLOAD_TOKEN: &str = "SNAPFEED_UPLOAD_TOKEN";
pub const ENV_RUN_ONCE: &str = "SNAPFEED_RUN_ONCE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid shard map: {0}")]
    Shard(#[from] ShardError),

    #[error("invalid trading window: {0}")]
    Window(#[from] WindowError),

    #[error("{0}")]
    Invalid(String),

    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("upload sink: {0}")]
    Upload(#[from] UploadError),

    #[error("fetch source: {0}")]
    Source(#[from] FetchError),
}

/// Top-level pipeline file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub total_batches: u32,
    #[serde(default = "default_list_field")]
    pub list_field: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Explicit shard table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shards: Vec<Shard>,
    /// Base URLs for an even split of `[1, total_batches]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shard_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_primary_workers")]
    pub primary_workers: usize,
    #[serde(default = "default_retry_workers")]
    pub retry_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(default = "default_first_weekday")]
    pub first_weekday: Weekday,
    #[serde(default = "default_last_weekday")]
    pub last_weekday: Weekday,
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Minutes east of UTC that define "local time".
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_snapshot_collection")]
    pub snapshot_collection: String,
    #[serde(default = "default_daily_collection")]
    pub daily_collection: String,
    #[serde(default = "default_fallback_collection")]
    pub fallback_collection: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub hourly: bool,
    #[serde(default = "default_summary_cutoff_hour")]
    pub summary_cutoff_hour: u32,
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Where finished archives go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum UploadConfig {
    Local {
        dir: PathBuf,
    },
    Http {
        url: String,
        #[serde(default = "default_upload_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_list_field() -> String {
    DEFAULT_LIST_FIELD.to_string()
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay_secs() -> u64 {
    5
}
fn default_primary_workers() -> usize {
    10
}
fn default_retry_workers() -> usize {
    5
}
fn default_first_weekday() -> Weekday {
    Weekday::Mon
}
fn default_last_weekday() -> Weekday {
    Weekday::Fri
}
fn default_start_hour() -> u32 {
    9
}
fn default_end_hour() -> u32 {
    16
}
fn default_cycle_interval_secs() -> u64 {
    30
}
fn default_utc_offset_minutes() -> i32 {
    330
}
fn default_snapshot_collection() -> String {
    "latest_snapshot".to_string()
}
fn default_daily_collection() -> String {
    "file_links".to_string()
}
fn default_fallback_collection() -> String {
    "daily_data".to_string()
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("archives")
}
fn default_summary_cutoff_hour() -> u32 {
    15
}
fn default_upload_timeout_secs() -> u64 {
    60
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            primary_workers: default_primary_workers(),
            retry_workers: default_retry_workers(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            first_weekday: default_first_weekday(),
            last_weekday: default_last_weekday(),
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            cycle_interval_secs: default_cycle_interval_secs(),
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_collection: default_snapshot_collection(),
            daily_collection: default_daily_collection(),
            fallback_collection: default_fallback_collection(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: default_archive_dir(),
            hourly: false,
            summary_cutoff_hour: default_summary_cutoff_hour(),
            upload: UploadConfig::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig::Local {
            dir: PathBuf::from("uploads"),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a pipeline file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a pipeline TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every startup invariant without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shard_map()?;
        self.schedule.window()?;
        self.schedule.clock()?;

        if self.source.timeout_secs == 0 {
            return Err(ConfigError::Invalid("source.timeout_secs must be positive".into()));
        }
        if self.source.list_field.is_empty() {
            return Err(ConfigError::Invalid("source.list_field must not be empty".into()));
        }
        if self.concurrency.primary_workers == 0 || self.concurrency.retry_workers == 0 {
            return Err(ConfigError::Invalid(
                "concurrency worker counts must be at least 1".into(),
            ));
        }
        if self.schedule.cycle_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "schedule.cycle_interval_secs must be positive".into(),
            ));
        }
        if self.archive.summary_cutoff_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "archive.summary_cutoff_hour {} is not an hour of the day",
                self.archive.summary_cutoff_hour
            )));
        }
        let collections = [
            &self.store.snapshot_collection,
            &self.store.daily_collection,
            &self.store.fallback_collection,
        ];
        if collections.iter().any(|c| c.is_empty()) {
            return Err(ConfigError::Invalid("store collection names must not be empty".into()));
        }
        if collections[0] == collections[1]
            || collections[0] == collections[2]
            || collections[1] == collections[2]
        {
            return Err(ConfigError::Invalid(
                "store collections must be distinct".into(),
            ));
        }
        Ok(())
    }

    /// Build the validated shard map from either `shards` or `shard_urls`.
    pub fn shard_map(&self) -> Result<ShardMap, ConfigError> {
        let src = &self.source;
        match (src.shards.is_empty(), src.shard_urls.is_empty()) {
            (false, false) => Err(ConfigError::Invalid(
                "set either source.shards or source.shard_urls, not both".into(),
            )),
            (false, true) => Ok(ShardMap::new(src.total_batches, src.shards.clone())?),
            (true, _) => Ok(ShardMap::even_split(src.total_batches, &src.shard_urls)?),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.source.max_retries,
            Duration::from_secs(self.source.retry_delay_secs),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_secs)
    }

    pub fn archive_naming(&self) -> ArchiveNaming {
        if self.archive.hourly {
            ArchiveNaming::Hourly
        } else {
            ArchiveNaming::Daily
        }
    }
}

impl ScheduleConfig {
    pub fn window(&self) -> Result<TradingWindow, WindowError> {
        TradingWindow::new(
            self.first_weekday,
            self.last_weekday,
            self.start_hour,
            self.end_hour,
        )
    }

    pub fn clock(&self) -> Result<SystemClock, ConfigError> {
        SystemClock::from_offset_minutes(self.utc_offset_minutes).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "schedule.utc_offset_minutes {} is out of range",
                self.utc_offset_minutes
            ))
        })
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

/// Settings taken from the process environment.
#[derive(Clone, PartialEq, Eq)]
pub struct EnvSettings {
    pub store_url: String,
    pub upload_token: Option<String>,
    pub run_once: bool,
}

impl std::fmt::Debug for EnvSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvSettings")
            .field("store_url", &self.store_url)
            .field("upload_token", &self.upload_token.as_ref().map(|_| "***"))
            .field("run_once", &self.run_once)
            .finish()
    }
}

impl EnvSettings {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store_url = get(ENV_STORE_URL).ok_or(ConfigError::MissingEnv(ENV_STORE_URL))?;
        let upload_token = get(ENV_UPLOAD_TOKEN);
        let run_once = get(ENV_RUN_ONCE).is_some_and(|v| parse_flag(&v));

        Ok(Self {
            store_url,
            upload_token,
            run_once,
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}
