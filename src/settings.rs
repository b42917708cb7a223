use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::backend::DurationUnit;

pub const ENV_BACKEND_URL: &str = "STUDYROOM_BACKEND_URL";
pub const ENV_ANON_KEY: &str = "STUDYROOM_ANON_KEY";
pub const ENV_ROOM_ID: &str = "STUDYROOM_ROOM_ID";
pub const ENV_DEBUG: &str = "STUDYROOM_DEBUG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendSettings {
    pub url: String,
    pub anon_key: String,
    /// Room to follow; the most recently started room when unset.
    pub room_id: Option<i64>,
    pub duration_unit: DurationUnit,
    /// Listen for table changes over the realtime websocket.
    pub realtime: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            room_id: None,
            duration_unit: DurationUnit::default(),
            realtime: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    pub fallback_interval_secs: u64,
    pub expiry_poll_secs: u64,
    pub fetch_timeout_secs: u64,
    pub max_fetch_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub heartbeat_every_ticks: u32,
    pub tick_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fallback_interval_secs: 30,
            expiry_poll_secs: 10,
            fetch_timeout_secs: 10,
            max_fetch_attempts: 4,
            base_backoff_ms: 250,
            max_backoff_ms: 8_000,
            heartbeat_every_ticks: 10,
            tick_interval_ms: 1_000,
        }
    }
}

impl SyncSettings {
    pub fn fallback_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_interval_secs.max(1))
    }

    pub fn expiry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_poll_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub backend: BackendSettings,
    pub sync: SyncSettings,
}

impl Settings {
    /// Applies `STUDYROOM_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BACKEND_URL) {
            self.backend.url = url;
        }
        if let Some(key) = lookup(ENV_ANON_KEY) {
            self.backend.anon_key = key;
        }
        if let Some(raw) = lookup(ENV_ROOM_ID) {
            match raw.trim().parse::<i64>() {
                Ok(room_id) => self.backend.room_id = Some(room_id),
                Err(err) => warn!("Ignoring {ENV_ROOM_ID}='{raw}': {err}"),
            }
        }
        let debug_mode = lookup(ENV_DEBUG)
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            self.sync.heartbeat_every_ticks = 1;
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            read_settings(&path)?
        } else {
            Settings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings with environment overrides applied.
    pub fn settings(&self) -> Settings {
        let mut settings = self.read().clone();
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    /// Changes the stored settings (without environment overrides) and
    /// writes them out.
    pub fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.write();
        change(&mut guard);
        self.persist(&guard)
    }

    /// Writes the in-memory settings (defaults on first run) to disk.
    pub fn save(&self) -> Result<()> {
        let guard = self.read();
        self.persist(&guard)
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create settings directory {}", parent.display())
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn read_settings(path: &Path) -> Result<Settings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse settings in {}", path.display()))
}
