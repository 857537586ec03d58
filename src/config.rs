//! # Configuration Module
//!
//! Persisted user settings shared by the daemon and the command-line client.
//!
//! ## Configuration Storage
//! Settings are stored as JSON in:
//! `~/.config/pixelpull/config.json`
//!
//! Every getter reads the file again, so a value written by one process is
//! visible to the next read in any other process. A missing file or a missing
//! key falls back to its documented default; an unreadable or corrupt file is
//! an error the caller has to deal with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::NaiveTime;
use tracing::warn;

/// Image used when the user has never entered a URL.
pub const DEFAULT_WALLPAPER_URL: &str = "https://lifecal-virid.vercel.app/months?height=2340&width=1080";

/// Directory name under the platform config/data directories.
pub const APP_DIR_NAME: &str = "pixelpull";

/// Errors raised when the settings file cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine a configuration directory")]
    NoConfigDir,
    #[error("configuration storage unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A time of day (24-hour clock) at which the daily update runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleTime {
    hour: u8,
    minute: u8,
}

impl ScheduleTime {
    /// Returns `None` unless `hour` is in 0..=23 and `minute` in 0..=59.
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    /// The time as a chrono value with zero seconds.
    pub fn as_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }

    /// Formats the time on a 12-hour clock, e.g. "7:30 AM" or "12:05 PM".
    pub fn format_12h(&self) -> String {
        let suffix = if self.hour < 12 { "AM" } else { "PM" };
        let hour = match self.hour % 12 {
            0 => 12,
            h => h,
        };
        format!("{}:{:02} {}", hour, self.minute, suffix)
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Error returned when parsing an `HH:MM` string fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeParseError {
    #[error("expected a time in HH:MM format, got {0:?}")]
    Format(String),
    #[error("{0} is not a valid time of day")]
    OutOfRange(String),
}

impl FromStr for ScheduleTime {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (hour, minute) = s
            .split_once(':')
            .ok_or_else(|| TimeParseError::Format(s.to_string()))?;
        let hour: u8 = hour
            .parse()
            .map_err(|_| TimeParseError::Format(s.to_string()))?;
        let minute: u8 = minute
            .parse()
            .map_err(|_| TimeParseError::Format(s.to_string()))?;
        Self::new(hour, minute).ok_or_else(|| TimeParseError::OutOfRange(s.to_string()))
    }
}

/// The daily schedule as seen by the scheduler and the client.
///
/// `enabled` is only ever true when a time is set; [`ScheduleConfig::enabled`]
/// enforces that for values read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleConfig {
    /// Configured time of day, `None` if the user never picked one
    pub time: Option<ScheduleTime>,
    enabled: bool,
}

impl ScheduleConfig {
    /// An enabled schedule at `time`.
    pub fn enabled(time: ScheduleTime) -> Self {
        Self { time: Some(time), enabled: true }
    }

    /// A disabled schedule that remembers its last time, if any.
    pub fn disabled(time: Option<ScheduleTime>) -> Self {
        Self { time, enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The time the scheduler should arm for, if the schedule is active.
    pub fn active_time(&self) -> Option<ScheduleTime> {
        if self.enabled {
            self.time
        } else {
            None
        }
    }
}

/// Which surface receives the wallpaper.
///
/// Desktops without a separate lock screen image apply every target to their
/// single background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WallpaperTarget {
    #[default]
    Home,
    Lock,
    Both,
}

impl WallpaperTarget {
    pub fn includes_home(&self) -> bool {
        matches!(self, Self::Home | Self::Both)
    }

    pub fn includes_lock(&self) -> bool {
        matches!(self, Self::Lock | Self::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Lock => "lock",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for WallpaperTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WallpaperTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "home" => Ok(Self::Home),
            "lock" => Ok(Self::Lock),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown wallpaper target {other:?} (expected home, lock or both)")),
        }
    }
}

/// On-disk layout. Every field is optional so that absent keys take defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoredSettings {
    wallpaper_url: Option<String>,
    schedule_hour: Option<u8>,
    schedule_minute: Option<u8>,
    schedule_enabled: bool,
    wallpaper_target: Option<WallpaperTarget>,
    notify_on_success: Option<bool>,
}

impl StoredSettings {
    fn schedule(&self) -> ScheduleConfig {
        let time = match (self.schedule_hour, self.schedule_minute) {
            (Some(h), Some(m)) => {
                let time = ScheduleTime::new(h, m);
                if time.is_none() {
                    warn!(hour = h, minute = m, "ignoring out-of-range schedule time in config");
                }
                time
            }
            _ => None,
        };

        match time {
            Some(t) if self.schedule_enabled => ScheduleConfig::enabled(t),
            _ => ScheduleConfig::disabled(time),
        }
    }
}

/// File-backed settings store.
///
/// Opened once at process start and shared by reference. The internal lock
/// only serializes read-modify-write cycles within this process.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Opens the store at `~/.config/pixelpull/config.json`.
    pub fn open_default() -> Result<Self, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Self::open(dir.join(APP_DIR_NAME).join("config.json"))
    }

    /// Opens the store at an explicit path, creating the parent directory.
    ///
    /// The file itself is created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Unavailable {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(Self { path, write_lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The wallpaper source URL, or [`DEFAULT_WALLPAPER_URL`] if never set.
    pub fn wallpaper_url(&self) -> Result<String, ConfigError> {
        Ok(self
            .read()?
            .wallpaper_url
            .unwrap_or_else(|| DEFAULT_WALLPAPER_URL.to_string()))
    }

    /// Stores `url` exactly as given.
    pub fn set_wallpaper_url(&self, url: &str) -> Result<(), ConfigError> {
        self.update(|s| s.wallpaper_url = Some(url.to_string()))
    }

    pub fn schedule(&self) -> Result<ScheduleConfig, ConfigError> {
        Ok(self.read()?.schedule())
    }

    /// Stores the schedule time and enables it in a single write.
    pub fn set_schedule(&self, time: ScheduleTime) -> Result<(), ConfigError> {
        self.update(|s| {
            s.schedule_hour = Some(time.hour());
            s.schedule_minute = Some(time.minute());
            s.schedule_enabled = true;
        })
    }

    /// Turns the schedule off, keeping the last time for display.
    pub fn disable_schedule(&self) -> Result<(), ConfigError> {
        self.update(|s| s.schedule_enabled = false)
    }

    pub fn wallpaper_target(&self) -> Result<WallpaperTarget, ConfigError> {
        Ok(self.read()?.wallpaper_target.unwrap_or_default())
    }

    pub fn set_wallpaper_target(&self, target: WallpaperTarget) -> Result<(), ConfigError> {
        self.update(|s| s.wallpaper_target = Some(target))
    }

    /// Whether scheduled runs announce success. Defaults to true.
    pub fn notify_on_success(&self) -> Result<bool, ConfigError> {
        Ok(self.read()?.notify_on_success.unwrap_or(true))
    }

    pub fn set_notify_on_success(&self, enabled: bool) -> Result<(), ConfigError> {
        self.update(|s| s.notify_on_success = Some(enabled))
    }

    fn read(&self) -> Result<StoredSettings, ConfigError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoredSettings::default()),
            Err(source) => {
                return Err(ConfigError::Unavailable { path: self.path.clone(), source });
            }
        };

        if content.trim().is_empty() {
            return Ok(StoredSettings::default());
        }

        serde_json::from_str(&content).map_err(|source| ConfigError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn update(&self, change: impl FnOnce(&mut StoredSettings)) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut settings = self.read()?;
        change(&mut settings);

        let content = serde_json::to_string_pretty(&settings).map_err(|source| ConfigError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        // Write beside the target and rename so readers never see a partial file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|source| ConfigError::Unavailable { path: self.path.clone(), source })
    }
}
