//! Configuration management for the session safekeeper.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`BROWSESSION__SECTION__KEY`). A missing file is replaced by a template and
//! reported as an error, so the first run tells the user what to fill in.

use crate::detect::lockfile::LockProbeMode;
use crate::detect::BrowserPreset;
use crate::retention::policy::RetentionPolicy;
use crate::retention::CompressionPolicy;
use crate::scheduler::{EmergencySettings, SchedulerSettings};
use crate::snapshot::copy::CopyPolicy;
use crate::snapshot::layout::SnapshotNaming;
use crate::snapshot::FileSpec;
use crate::utils::errors::{BrowsessionError, Result};
use chrono::format::{Item, StrftimeItems};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "BROWSESSION";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub files: FilesConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Browser profile directory; `$VAR`, `${VAR}` and `%VAR%` are expanded
    pub browser_profile: PathBuf,

    /// Where snapshots are written
    #[serde(default = "default_backup_dirs_root")]
    pub backup_dirs_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Files or directories (relative to the profile) that make a snapshot complete
    pub main: Vec<String>,

    /// Best-effort extras, usually heavy; left out of emergency snapshots
    #[serde(default)]
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionStrategy {
    Process,
    LockFile,
    Activity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_strategy")]
    pub strategy: DetectionStrategy,

    /// Lock-file settings for a known browser; explicit `lock_file` wins
    #[serde(default)]
    pub preset: Option<BrowserPreset>,

    /// Executable name for the `process` strategy
    #[serde(default)]
    pub process_name: Option<String>,

    /// Lock file (relative to the profile) for the `lock-file` strategy
    #[serde(default)]
    pub lock_file: Option<String>,

    #[serde(default = "default_lock_probe")]
    pub lock_probe: LockProbeMode,

    /// Seconds after the last write the browser still counts as running
    #[serde(default = "default_activity_grace_secs")]
    pub activity_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// 0 disables periodic snapshots
    #[serde(default = "default_periodic_interval_secs")]
    pub periodic_interval_secs: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// strftime format for the timestamp in snapshot names
    #[serde(default = "default_datetime_format")]
    pub datetime_format: String,

    #[serde(default = "default_regular_tag")]
    pub regular_tag: String,

    #[serde(default = "default_emergency_tag")]
    pub emergency_tag: String,

    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,

    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,

    /// Skip periodic and emergency snapshots when nothing changed since the last one
    #[serde(default = "default_true")]
    pub skip_unchanged: bool,

    /// zstd level used when compressing aged snapshots (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_max_count")]
    pub max_count: Option<usize>,

    #[serde(default)]
    pub max_age_days: Option<u64>,

    #[serde(default = "default_emergency_max_count")]
    pub emergency_max_count: Option<usize>,

    /// Newest snapshots of each kind kept uncompressed; unset disables compression
    #[serde(default = "default_keep_uncompressed")]
    pub keep_uncompressed: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Free bytes on the profile's volume below which an emergency snapshot is taken
    #[serde(default = "default_free_space_trigger")]
    pub free_space_trigger: u64,

    #[serde(default = "default_emergency_cooldown_secs")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for the daily-rotated log file; stdout only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// Default values
fn default_backup_dirs_root() -> PathBuf {
    PathBuf::from("BrowsessionBackups")
}

fn default_strategy() -> DetectionStrategy {
    DetectionStrategy::LockFile
}

fn default_lock_probe() -> LockProbeMode {
    LockProbeMode::Held
}

fn default_activity_grace_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_periodic_interval_secs() -> u64 {
    15 * 60
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_datetime_format() -> String {
    "%Y-%m-%d %H-%M-%S".to_string()
}

fn default_regular_tag() -> String {
    "regular".to_string()
}

fn default_emergency_tag() -> String {
    "emergency".to_string()
}

fn default_lock_retry_attempts() -> u32 {
    3
}

fn default_lock_retry_delay_ms() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_count() -> Option<usize> {
    Some(5)
}

fn default_emergency_max_count() -> Option<usize> {
    Some(3)
}

fn default_keep_uncompressed() -> Option<usize> {
    Some(1)
}

fn default_free_space_trigger() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_emergency_cooldown_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            preset: Some(BrowserPreset::Chromium),
            process_name: None,
            lock_file: None,
            lock_probe: default_lock_probe(),
            activity_grace_secs: default_activity_grace_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            periodic_interval_secs: default_periodic_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            datetime_format: default_datetime_format(),
            regular_tag: default_regular_tag(),
            emergency_tag: default_emergency_tag(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            skip_unchanged: true,
            compression_level: default_compression_level(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            max_age_days: None,
            emergency_max_count: default_emergency_max_count(),
            keep_uncompressed: default_keep_uncompressed(),
        }
    }
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            free_space_trigger: default_free_space_trigger(),
            cooldown_secs: default_emergency_cooldown_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl Config {
    /// Load `path`, layered with `BROWSESSION__*` environment overrides.
    ///
    /// A missing file is created from [`Config::template`] and reported as a
    /// configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: &Path, env_prefix: &str) -> Result<Self> {
        if !path.exists() {
            Self::write_template(path)?;
            return Err(BrowsessionError::Config(format!(
                "{} was not found; a template has been written there, set paths.browser_profile and files.main",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix(env_prefix).separator("__"))
            .build()
            .map_err(|e| BrowsessionError::Config(e.to_string()))?;

        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| BrowsessionError::Config(format!("{}: {}", path.display(), e)))?;

        config.paths.browser_profile = expand_env(&config.paths.browser_profile);
        config.paths.backup_dirs_root = expand_env(&config.paths.backup_dirs_root);
        if let Some(dir) = &config.log.directory {
            config.log.directory = Some(expand_env(dir));
        }

        config.validate()?;
        Ok(config)
    }

    /// Settings that are wrong regardless of what is on disk.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(BrowsessionError::Config(msg));

        if self.paths.browser_profile.as_os_str().is_empty() {
            return invalid("paths.browser_profile is not set".into());
        }
        if self.files.main.iter().all(|f| f.trim().is_empty()) {
            return invalid("files.main lists no files".into());
        }

        let snapshot = &self.snapshot;
        if StrftimeItems::new(&snapshot.datetime_format).any(|item| matches!(item, Item::Error)) {
            return invalid(format!(
                "snapshot.datetime_format '{}' is not a valid strftime format",
                snapshot.datetime_format
            ));
        }
        for (key, value) in [
            ("snapshot.datetime_format", &snapshot.datetime_format),
            ("snapshot.regular_tag", &snapshot.regular_tag),
            ("snapshot.emergency_tag", &snapshot.emergency_tag),
        ] {
            if value.contains(['/', '\\', '(', ')']) || value.trim().is_empty() {
                return invalid(format!(
                    "{} '{}' must be non-empty and contain no slashes or parentheses",
                    key, value
                ));
            }
        }
        if snapshot.regular_tag == snapshot.emergency_tag {
            return invalid("snapshot.regular_tag and snapshot.emergency_tag must differ".into());
        }
        if !(1..=22).contains(&snapshot.compression_level) {
            return invalid("snapshot.compression_level must be between 1 and 22".into());
        }

        if self.schedule.poll_interval_ms == 0 {
            return invalid("schedule.poll_interval_ms must be greater than 0".into());
        }

        match self.detection.strategy {
            DetectionStrategy::Process if self.detection.process_name.is_none() => {
                invalid("detection.process_name is required for the process strategy".into())
            }
            DetectionStrategy::LockFile
                if self.detection.lock_file.is_none() && self.detection.preset.is_none() =>
            {
                invalid("detection.lock_file or detection.preset is required for the lock-file strategy".into())
            }
            _ => Ok(()),
        }
    }

    /// Startup checks against the filesystem: the profile exists and at least
    /// one main file is currently there.
    pub fn check_profile(&self) -> Result<()> {
        let profile = &self.paths.browser_profile;
        if !profile.is_dir() {
            return Err(BrowsessionError::Config(format!(
                "browser profile {} does not exist",
                profile.display()
            )));
        }

        let mut found = 0;
        for pattern in &self.files.main {
            found += crate::fs::pattern::expand(profile, pattern)?.len();
        }
        if found == 0 {
            return Err(BrowsessionError::Config(format!(
                "none of files.main exist in {}",
                profile.display()
            )));
        }
        Ok(())
    }

    pub fn file_specs(&self) -> Vec<FileSpec> {
        let main = self.files.main.iter().map(FileSpec::main);
        let extra = self.files.extra.iter().map(FileSpec::extra);
        main.chain(extra).filter(|s| !s.pattern.trim().is_empty()).collect()
    }

    pub fn naming(&self) -> SnapshotNaming {
        SnapshotNaming {
            datetime_format: self.snapshot.datetime_format.clone(),
            regular_tag: self.snapshot.regular_tag.clone(),
            emergency_tag: self.snapshot.emergency_tag.clone(),
        }
    }

    pub fn copy_policy(&self) -> CopyPolicy {
        CopyPolicy {
            lock_retry_attempts: self.snapshot.lock_retry_attempts,
            lock_retry_delay: Duration::from_millis(self.snapshot.lock_retry_delay_ms),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: self.retention.max_count,
            max_age: self
                .retention
                .max_age_days
                .map(|days| Duration::from_secs(days * 24 * 3600)),
            emergency_max_count: self.retention.emergency_max_count,
        }
    }

    pub fn compression(&self) -> Option<CompressionPolicy> {
        self.retention.keep_uncompressed.map(|keep| CompressionPolicy {
            keep_uncompressed: keep,
            level: self.snapshot.compression_level,
        })
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let schedule = &self.schedule;
        SchedulerSettings {
            poll_interval: Duration::from_millis(schedule.poll_interval_ms),
            periodic_interval: (schedule.periodic_interval_secs > 0)
                .then(|| Duration::from_secs(schedule.periodic_interval_secs)),
            shutdown_grace: Duration::from_secs(schedule.shutdown_grace_secs),
            emergency: self.emergency.enabled.then(|| EmergencySettings {
                volume: self.paths.browser_profile.clone(),
                free_space_trigger: self.emergency.free_space_trigger,
                cooldown: Duration::from_secs(self.emergency.cooldown_secs),
            }),
        }
    }

    /// Example configuration written when none exists
    pub fn template() -> Self {
        Config {
            paths: PathsConfig {
                browser_profile: if cfg!(windows) {
                    PathBuf::from(r"%LOCALAPPDATA%\Chromium\User Data\Default")
                } else {
                    PathBuf::from("$HOME/.config/chromium/Default")
                },
                backup_dirs_root: default_backup_dirs_root(),
            },
            files: FilesConfig {
                main: vec!["Sessions".to_string(), "Preferences".to_string()],
                extra: vec!["History".to_string()],
            },
            detection: DetectionConfig::default(),
            schedule: ScheduleConfig::default(),
            snapshot: SnapshotConfig::default(),
            retention: RetentionConfig::default(),
            emergency: EmergencyConfig::default(),
            log: LogConfig {
                level: default_log_level(),
                directory: Some(PathBuf::from("logs")),
            },
        }
    }

    fn write_template(path: &Path) -> Result<()> {
        let body = toml::to_string_pretty(&Self::template())
            .map_err(|e| BrowsessionError::Config(e.to_string()))?;
        let contents = format!(
            "# browsession configuration\n\
             # Every setting can be overridden from the environment, e.g.\n\
             # {prefix}__RETENTION__MAX_COUNT=10\n\n{body}",
            prefix = ENV_PREFIX,
            body = body
        );

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Expand `$VAR`, `${VAR}` and `%VAR%`. Unset variables are left as written.
pub fn expand_env(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };

    let pattern = match Regex::new(r"\$\{(\w+)\}|\$(\w+)|%(\w+)%") {
        Ok(pattern) => pattern,
        Err(_) => return path.to_path_buf(),
    };

    let expanded = pattern.replace_all(raw, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map_or("", |m| m.as_str());
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    });

    PathBuf::from(expanded.into_owned())
}
