use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::assignment::SeriesSharing;
use crate::filter::SeriesQuery;
use crate::layout::ViewportLayout;
use crate::sync::SyncFlags;

const SETTINGS_DIR: &str = "perspecta";
const SETTINGS_FILE: &str = "compare.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub series_sharing: SeriesSharing,
    pub layout: ViewportLayout,
    pub sync: SyncFlags,
    pub series_query: SeriesQuery,
}

impl ViewerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read settings file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Could not parse settings file {}", path.display()))
    }

    /// Settings from `path` when readable, defaults otherwise, with
    /// environment overrides applied on top.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        Self::load_stored_or_default(path).with_env_overrides()
    }

    /// Settings from `path` exactly as stored, defaults when unreadable.
    pub fn load_stored_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(path) if path.exists() => Self::load(path).unwrap_or_else(|err| {
                log::warn!("{err:#}; using default settings");
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// What to write back to the settings file. Overridable fields that still
    /// hold their `startup` value keep the `stored` value, so environment and
    /// launch overrides only last for one run.
    pub fn to_persist(&self, startup: &ViewerConfig, stored: &ViewerConfig) -> ViewerConfig {
        let mut persisted = self.clone();
        if self.layout == startup.layout {
            persisted.layout = stored.layout;
        }
        if self.series_sharing == startup.series_sharing {
            persisted.series_sharing = stored.series_sharing;
        }
        persisted
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Could not create settings directory {}", parent.display())
            })?;
        }
        let text = serde_json::to_string_pretty(self).context("Could not encode settings")?;
        fs::write(path, text)
            .with_context(|| format!("Could not write settings file {}", path.display()))
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(shared) = configured_shared_series() {
            self.series_sharing = if shared {
                SeriesSharing::Shared
            } else {
                SeriesSharing::Exclusive
            };
        }
        if let Some(layout) = configured_layout() {
            self.layout = layout;
        }
        self
    }
}

pub fn settings_file_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        return env::var_os("APPDATA")
            .map(PathBuf::from)
            .map(|base| base.join(SETTINGS_DIR).join(SETTINGS_FILE));
    }

    #[cfg(target_os = "macos")]
    {
        return env::var_os("HOME").map(PathBuf::from).map(|home| {
            home.join("Library")
                .join("Application Support")
                .join(SETTINGS_DIR)
                .join(SETTINGS_FILE)
        });
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join(SETTINGS_DIR).join(SETTINGS_FILE));
        }
        env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".config").join(SETTINGS_DIR).join(SETTINGS_FILE))
    }
}

fn configured_shared_series() -> Option<bool> {
    static CONFIG: OnceLock<Option<bool>> = OnceLock::new();

    *CONFIG.get_or_init(|| {
        let raw = env::var("PERSPECTA_SHARED_SERIES").ok()?;
        parse_bool_flag(&raw)
    })
}

fn configured_layout() -> Option<ViewportLayout> {
    static CONFIG: OnceLock<Option<ViewportLayout>> = OnceLock::new();

    *CONFIG.get_or_init(|| {
        let raw = env::var("PERSPECTA_LAYOUT").ok()?;
        match raw.parse() {
            Ok(layout) => Some(layout),
            Err(err) => {
                log::warn!("Ignoring PERSPECTA_LAYOUT: {err}");
                None
            }
        }
    })
}

fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
