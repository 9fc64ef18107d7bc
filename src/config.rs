//! Management policy configuration.
//!
//! Loaded from a TOML file and delivered to the manager as a whole value,
//! both at startup and on every reload.

use crate::discovery::InputDevice;
use crate::keys::KeyIgnorePolicy;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Mouse devices excluded from presence monitoring, matched against either
/// the device name or its syspath.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoredDeviceSet(BTreeSet<String>);

impl IgnoredDeviceSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, device: &InputDevice) -> bool {
        self.0.contains(&device.name) || self.0.contains(device.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Settings file as written by the user. Every field is optional and falls
/// back to the defaults of [`ManagementConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub monitor_mouse: Option<bool>,
    pub ignored_mouse_devices: Option<Vec<String>>,
    pub monitor_keyboard: Option<bool>,
    pub key_ignore_policy: Option<KeyIgnorePolicy>,
    /// Seconds.
    pub idle_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementConfig {
    pub monitor_mouse: bool,
    pub ignored_mouse_devices: IgnoredDeviceSet,
    pub monitor_keyboard: bool,
    pub key_ignore_policy: KeyIgnorePolicy,
    pub idle_time: Duration,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            monitor_mouse: true,
            ignored_mouse_devices: IgnoredDeviceSet::default(),
            monitor_keyboard: true,
            key_ignore_policy: KeyIgnorePolicy::default(),
            idle_time: Duration::from_secs(2),
        }
    }
}

impl ManagementConfig {
    /// Loads the configuration file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let raw: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let idle_time = match raw.idle_time {
            Some(secs) => idle_time_from_secs(secs)?,
            None => defaults.idle_time,
        };
        Ok(Self {
            monitor_mouse: raw.monitor_mouse.unwrap_or(defaults.monitor_mouse),
            ignored_mouse_devices: raw
                .ignored_mouse_devices
                .map(IgnoredDeviceSet::new)
                .unwrap_or(defaults.ignored_mouse_devices),
            monitor_keyboard: raw.monitor_keyboard.unwrap_or(defaults.monitor_keyboard),
            key_ignore_policy: raw.key_ignore_policy.unwrap_or(defaults.key_ignore_policy),
            idle_time,
        })
    }
}

/// Longest accepted `idle_time`.
pub const MAX_IDLE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

pub fn idle_time_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(idle) if idle <= MAX_IDLE_TIME => Ok(idle),
        _ => Err(ConfigError::Invalid(format!(
            "idle_time must be between 0 and {} seconds, got {}",
            MAX_IDLE_TIME.as_secs(),
            secs
        ))),
    }
}

/// `$XDG_CONFIG_HOME/padwatch/config.toml`, or a relative fallback.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("padwatch"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}
