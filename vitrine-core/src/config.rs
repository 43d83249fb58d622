use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, VitrineError};
use crate::models::{ClampMode, PropertyValue, ScalingMode};

pub const DEFAULT_ENGINE: &str = "linux-wallpaperengine";

/// Flat settings map persisted as `settings.json`. Every key has a default, so
/// a partial or empty file still yields a complete configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub wallpaper_engine: String,
    pub fps: u32,
    pub volume: u32,
    pub silence: bool,
    pub scaling: ScalingMode,
    pub clamp: ClampMode,
    pub no_fullscreen_pause: bool,
    pub disable_mouse: bool,
    pub no_automute: bool,
    pub no_audio_processing: bool,
    pub disable_parallax: bool,
    pub disable_particles: bool,
    pub fullscreen_pause_only_active: bool,
    /// Comma-separated Wayland app ids that never pause the wallpaper.
    pub fullscreen_pause_ignore_appids: String,
    pub assets_dir: String,
    pub active_monitors: BTreeMap<String, String>,
    pub last_wallpaper: String,
    pub last_screen: String,
    /// Per-wallpaper property overrides, keyed by wallpaper id then property name.
    pub properties: BTreeMap<String, BTreeMap<String, PropertyValue>>,
    pub record_history: bool,
    /// Frames the engine renders before writing a screenshot.
    pub screenshot_delay: u32,
    pub screenshot_resolution: u32,
    pub prefer_xvfb: bool,
    pub notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wallpaper_engine: DEFAULT_ENGINE.into(),
            fps: 30,
            volume: 50,
            silence: false,
            scaling: ScalingMode::Default,
            clamp: ClampMode::Clamp,
            no_fullscreen_pause: false,
            disable_mouse: false,
            no_automute: false,
            no_audio_processing: false,
            disable_parallax: false,
            disable_particles: false,
            fullscreen_pause_only_active: false,
            fullscreen_pause_ignore_appids: String::new(),
            assets_dir: String::new(),
            active_monitors: BTreeMap::new(),
            last_wallpaper: String::new(),
            last_screen: String::new(),
            properties: BTreeMap::new(),
            record_history: true,
            screenshot_delay: 20,
            screenshot_resolution: 1920,
            prefer_xvfb: true,
            notifications: true,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VitrineError::Config(format!("failed to read {}: {e}", path.display())))?;
        let settings: Self = serde_json::from_str(&content)?;
        Ok(settings)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                debug!(path = %path.display(), "using default settings: {e}");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| VitrineError::Config(format!("failed to write {}: {e}", path.display())))
    }

    /// Ignore-list ids, trimmed, empties dropped.
    pub fn ignored_appids(&self) -> impl Iterator<Item = &str> {
        self.fullscreen_pause_ignore_appids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn to_map(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(VitrineError::Config("settings did not serialize to a map".into())),
        }
    }
}

/// Process-wide settings cache backed by the JSON file. Readers get a
/// consistent copy; every write persists before returning.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    inner: RwLock<Settings>,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = Settings::load_or_default(&path);
        Self {
            path,
            inner: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Settings {
        self.read().clone()
    }

    /// Look up one key of the flat map. Unknown keys are an error, not `null`.
    pub fn get(&self, key: &str) -> Result<serde_json::Value> {
        let map = self.read().to_map()?;
        map.get(key)
            .cloned()
            .ok_or_else(|| VitrineError::UnknownSetting(key.to_string()))
    }

    /// Replace one key. The new value must deserialize into the key's type.
    pub fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut guard = self.write();
        let mut map = guard.to_map()?;
        if !map.contains_key(key) {
            return Err(VitrineError::UnknownSetting(key.to_string()));
        }
        map.insert(key.to_string(), value);
        let updated: Settings = serde_json::from_value(serde_json::Value::Object(map))?;
        updated.save(&self.path)?;
        *guard = updated;
        Ok(())
    }

    /// Mutate in place and persist. Returns whatever the closure returns.
    pub fn update<T>(&self, f: impl FnOnce(&mut Settings) -> T) -> Result<T> {
        let mut guard = self.write();
        let out = f(&mut *guard);
        guard.save(&self.path)?;
        Ok(out)
    }

    /// Re-read the file, falling back to defaults.
    pub fn reload(&self) {
        let settings = Settings::load_or_default(&self.path);
        *self.write() = settings;
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        self.inner.read().unwrap_or_else(|poisoned| {
            warn!("settings lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        self.inner.write().unwrap_or_else(|poisoned| {
            warn!("settings lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
