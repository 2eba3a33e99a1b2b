//! Runtime configuration.
//!
//! Values come from three layers, later ones winning:
//! - built-in defaults for the host application
//! - `config.toml` in the platform config dir (or `--config`)
//! - command line flags, applied by the caller
//!
//! Example file:
//!
//! ```toml
//! [host]
//! name = "Antigravity"
//! state_dir = "/home/me/.config/Antigravity/User/globalStorage"
//! executable = "/opt/Antigravity/antigravity"
//! uri = "antigravity://oauth-success"
//! uri_opener = "/usr/bin/gio-open"
//!
//! [timeouts]
//! graceful_stop = "10s"
//! force_stop = "3s"
//! launch_confirm = "2s"
//! poll_interval = "250ms"
//!
//! [store]
//! data_dir = "/home/me/.local/share/idswap"
//! order = "last-used"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::platform::{self, Platform};

pub const DEFAULT_HOST_NAME: &str = "Antigravity";
pub const DEFAULT_HOST_URI: &str = "antigravity://oauth-success";

/// Everything needed to find, stop and relaunch the host application.
#[derive(Debug, Clone)]
pub struct HostProfile {
    pub name: String,
    /// The live state directory (ActiveState).
    pub state_dir: PathBuf,
    /// Direct-launch candidates, tried in order.
    pub executables: Vec<PathBuf>,
    /// Fallback when no executable is found.
    pub uri: Option<String>,
    /// Program that opens `uri`; the platform opener when unset.
    pub uri_opener: Option<PathBuf>,
}

impl HostProfile {
    pub fn for_platform(name: &str, platform: Platform) -> Result<Self> {
        let state_dir = platform::default_state_dir(name).ok_or_else(|| {
            Error::Config("could not determine the host's config directory".into())
        })?;

        Ok(HostProfile {
            name: name.to_string(),
            state_dir,
            executables: platform::default_executable_candidates(name, platform),
            uri: Some(DEFAULT_HOST_URI.to_string()),
            uri_opener: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub graceful_stop: Duration,
    /// How long to wait for processes to vanish after a forced kill.
    pub force_stop: Duration,
    pub launch_confirm: Duration,
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            graceful_stop: Duration::from_secs(10),
            force_stop: Duration::from_secs(3),
            launch_confirm: Duration::from_secs(2),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    #[default]
    Created,
    LastUsed,
    Name,
}

impl ListOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ListOrder::Created),
            "last-used" => Some(ListOrder::LastUsed),
            "name" => Some(ListOrder::Name),
            _ => None,
        }
    }
}

pub struct Config {
    pub host: HostProfile,
    pub timeouts: Timeouts,
    pub data_dir: PathBuf,
    pub order: ListOrder,
    pub relaunch: bool,
    pub platform: Platform,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    host: RawHost,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    store: RawStore,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHost {
    name: Option<String>,
    state_dir: Option<PathBuf>,
    executable: Option<PathBuf>,
    uri: Option<String>,
    uri_opener: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTimeouts {
    graceful_stop: Option<String>,
    force_stop: Option<String>,
    launch_confirm: Option<String>,
    poll_interval: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStore {
    data_dir: Option<PathBuf>,
    order: Option<String>,
}

/// ~/.config/idswap/config.toml or platform equivalent
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "idswap").map(|d| d.config_dir().join("config.toml"))
}

/// ~/.local/share/idswap or platform equivalent
pub fn default_data_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("", "", "idswap")
        .map(|d| d.data_dir().to_path_buf())
        .ok_or_else(|| Error::Config("could not determine data directory".into()))
}

impl Config {
    /// Load from an explicit path (which must exist) or the default location
    /// (which may be absent).
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let raw = match explicit {
            Some(path) => read_raw(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => read_raw(&path)?,
                _ => RawConfig::default(),
            },
        };
        Self::from_raw(raw, platform::detect())
    }

    pub fn from_toml_str(contents: &str, platform: Platform) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_raw(raw, platform)
    }

    fn from_raw(raw: RawConfig, platform: Platform) -> Result<Self> {
        let name = raw.host.name.unwrap_or_else(|| DEFAULT_HOST_NAME.to_string());
        let mut host = match raw.host.state_dir {
            Some(state_dir) => HostProfile {
                name: name.clone(),
                state_dir,
                executables: platform::default_executable_candidates(&name, platform),
                uri: Some(DEFAULT_HOST_URI.to_string()),
                uri_opener: None,
            },
            None => HostProfile::for_platform(&name, platform)?,
        };
        if let Some(executable) = raw.host.executable {
            host.executables = vec![executable];
        }
        if let Some(uri) = raw.host.uri {
            // an empty string disables the uri fallback
            host.uri = if uri.is_empty() { None } else { Some(uri) };
        }
        host.uri_opener = raw.host.uri_opener;

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            graceful_stop: parse_duration("graceful_stop", raw.timeouts.graceful_stop)?
                .unwrap_or(defaults.graceful_stop),
            force_stop: parse_duration("force_stop", raw.timeouts.force_stop)?
                .unwrap_or(defaults.force_stop),
            launch_confirm: parse_duration("launch_confirm", raw.timeouts.launch_confirm)?
                .unwrap_or(defaults.launch_confirm),
            poll_interval: parse_duration("poll_interval", raw.timeouts.poll_interval)?
                .unwrap_or(defaults.poll_interval),
        };
        if timeouts.poll_interval.is_zero() {
            return Err(Error::Config("timeouts.poll_interval must be greater than zero".into()));
        }

        let data_dir = match raw.store.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        let order = match raw.store.order {
            Some(s) => ListOrder::parse(&s).ok_or_else(|| {
                Error::Config(format!(
                    "store.order must be one of created, last-used, name (got '{s}')"
                ))
            })?,
            None => ListOrder::default(),
        };

        Ok(Config {
            host,
            timeouts,
            data_dir,
            order,
            relaunch: true,
            platform,
        })
    }
}

fn read_raw(path: &Path) -> Result<RawConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
}

fn parse_duration(key: &str, value: Option<String>) -> Result<Option<Duration>> {
    value
        .map(|s| {
            humantime::parse_duration(&s)
                .map_err(|e| Error::Config(format!("timeouts.{key}: invalid duration '{s}': {e}")))
        })
        .transpose()
}
