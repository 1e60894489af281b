use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheLimits, DEFAULT_BYTE_LIMITS, DEFAULT_THUMBNAIL_LIMITS};
use crate::decode::{
    DEFAULT_HORIZON, DEFAULT_THUMBNAIL_WIDTH, DecodeConfig, default_max_concurrency,
};
use crate::fetch::{DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT, default_global_limit};
use crate::gallery::{DEFAULT_BATCH_SIZE, DEFAULT_TAIL_FLUSH, StreamOptions};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "gallery-stream";

const DEFAULT_PER_SESSION: usize = 4;
const DEFAULT_CHECK_INTERVAL_MS: u64 = 250;
const DEFAULT_COMPLETED_RETENTION_SECS: u64 = 600;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Process-wide fetch limit; derived from CPU count when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_concurrency: Option<usize>,

    #[serde(default = "default_per_session")]
    pub per_session: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            global_concurrency: None,
            per_session: DEFAULT_PER_SESSION,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: default_user_agent(),
        }
    }
}

impl FetchSettings {
    #[must_use]
    pub fn global_limit(&self) -> usize {
        self.global_concurrency.unwrap_or_else(default_global_limit)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_tail_flush")]
    pub tail_flush: usize,

    /// Finished sessions are dropped this long after finishing
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            tail_flush: DEFAULT_TAIL_FLUSH,
            completed_retention_secs: DEFAULT_COMPLETED_RETENTION_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl StreamSettings {
    #[must_use]
    pub fn options(&self) -> StreamOptions {
        StreamOptions {
            check_interval: Duration::from_millis(self.check_interval_ms),
            tail_flush: self.tail_flush,
        }
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeSettings {
    /// Decode workers; derived from CPU count when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    #[serde(default = "default_horizon")]
    pub horizon: usize,

    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            horizon: DEFAULT_HORIZON,
            thumbnail_width: DEFAULT_THUMBNAIL_WIDTH,
        }
    }
}

impl DecodeSettings {
    #[must_use]
    pub fn config(&self) -> DecodeConfig {
        DecodeConfig {
            max_concurrency: self.max_concurrency.unwrap_or_else(default_max_concurrency),
            horizon: self.horizon,
            width: self.thumbnail_width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_byte_cache")]
    pub byte_cache: CacheLimits,

    #[serde(default = "default_thumbnail_cache")]
    pub thumbnail_cache: CacheLimits,

    #[serde(default)]
    pub fetch: FetchSettings,

    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub decode: DecodeSettings,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_byte_cache() -> CacheLimits {
    DEFAULT_BYTE_LIMITS
}

fn default_thumbnail_cache() -> CacheLimits {
    DEFAULT_THUMBNAIL_LIMITS
}

fn default_per_session() -> usize {
    DEFAULT_PER_SESSION
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_check_interval_ms() -> u64 {
    DEFAULT_CHECK_INTERVAL_MS
}

fn default_tail_flush() -> usize {
    DEFAULT_TAIL_FLUSH
}

fn default_completed_retention_secs() -> u64 {
    DEFAULT_COMPLETED_RETENTION_SECS
}

fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

fn default_horizon() -> usize {
    DEFAULT_HORIZON
}

fn default_thumbnail_width() -> u32 {
    DEFAULT_THUMBNAIL_WIDTH
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            byte_cache: DEFAULT_BYTE_LIMITS,
            thumbnail_cache: DEFAULT_THUMBNAIL_LIMITS,
            fetch: FetchSettings::default(),
            stream: StreamSettings::default(),
            decode: DecodeSettings::default(),
        }
    }
}

#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

impl Settings {
    /// Load from the default location, writing a default file on first run.
    ///
    /// Never fails: unreadable or unparsable files are logged and the
    /// defaults are used.
    #[must_use]
    pub fn load() -> Self {
        let Some(path) = default_config_path() else {
            warn!("Could not determine config directory, using default settings");
            return Self::default();
        };
        Self::load_or_create(&path)
    }

    /// Like [`load`](Self::load) for an explicit path.
    #[must_use]
    pub fn load_or_create(path: &Path) -> Self {
        if !path.exists() {
            info!("Settings file not found, creating with defaults at {path:?}");
            let settings = Self::default();
            if let Err(e) = settings.save_to(path) {
                error!("{e:#}");
            }
            return settings;
        }

        match Self::load_from(path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("{e:#}");
                Self::default()
            }
        }
    }

    /// Read, migrate and validate settings from `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {path:?}"))?;
        let mut settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {path:?}"))?;
        debug!("Loaded settings from {path:?}");

        if settings.version < CURRENT_VERSION {
            migrate_settings(&mut settings);
            settings.save_to(path)?;
        }

        Ok(settings.validated())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {parent:?}"))?;
        }
        let body = serde_yaml::to_string(self).context("Failed to serialize settings")?;
        fs::write(path, format!("{SETTINGS_HEADER}{body}"))
            .with_context(|| format!("Failed to save settings to {path:?}"))?;
        debug!("Saved settings to {path:?}");
        Ok(())
    }

    /// Replace every invalid value with its default, logging each one.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if let Err(e) = self.byte_cache.validate() {
            error!("byte_cache: {e}, keeping defaults");
            self.byte_cache = DEFAULT_BYTE_LIMITS;
        }
        if let Err(e) = self.thumbnail_cache.validate() {
            error!("thumbnail_cache: {e}, keeping defaults");
            self.thumbnail_cache = DEFAULT_THUMBNAIL_LIMITS;
        }

        let fetch_defaults = FetchSettings::default();
        reject_zero(
            "fetch.per_session",
            &mut self.fetch.per_session,
            fetch_defaults.per_session,
        );
        reject_zero(
            "fetch.timeout_secs",
            &mut self.fetch.timeout_secs,
            fetch_defaults.timeout_secs,
        );
        if self.fetch.global_concurrency == Some(0) {
            error!("fetch.global_concurrency must be positive, deriving from CPU count");
            self.fetch.global_concurrency = None;
        }

        let stream_defaults = StreamSettings::default();
        reject_zero(
            "stream.batch_size",
            &mut self.stream.batch_size,
            stream_defaults.batch_size,
        );
        reject_zero(
            "stream.check_interval_ms",
            &mut self.stream.check_interval_ms,
            stream_defaults.check_interval_ms,
        );
        reject_zero(
            "stream.cleanup_interval_secs",
            &mut self.stream.cleanup_interval_secs,
            stream_defaults.cleanup_interval_secs,
        );

        reject_zero(
            "decode.thumbnail_width",
            &mut self.decode.thumbnail_width,
            DEFAULT_THUMBNAIL_WIDTH,
        );
        if self.decode.max_concurrency == Some(0) {
            error!("decode.max_concurrency must be positive, deriving from CPU count");
            self.decode.max_concurrency = None;
        }
        self
    }
}

fn reject_zero<T>(name: &str, value: &mut T, default: T)
where
    T: Copy + Default + PartialEq + std::fmt::Display,
{
    if *value == T::default() {
        error!("{name} must be positive, keeping {default}");
        *value = default;
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );
    settings.version = CURRENT_VERSION;
}

const SETTINGS_HEADER: &str = r#"# gallery-stream configuration
#
# byte_cache / thumbnail_cache: max_entries and max_bytes, both must be > 0.
# Tightening a limit evicts least recently used entries immediately.
# fetch.global_concurrency and decode.max_concurrency are derived from the
# CPU count when omitted.

"#;
