use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::models::{PlaybackRecord, ScreenshotRecord};

pub const PLAYBACK_HISTORY_LIMIT: usize = 100;

/// Append-only JSON array on disk, most recent entry last. `limit` drops the
/// oldest entries once exceeded.
#[derive(Debug, Clone)]
pub struct JsonLog<T> {
    path: PathBuf,
    limit: Option<usize>,
    _marker: std::marker::PhantomData<T>,
}

pub type PlaybackHistory = JsonLog<PlaybackRecord>;
pub type ScreenshotHistory = JsonLog<ScreenshotRecord>;

impl PlaybackHistory {
    pub fn playback(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Some(PLAYBACK_HISTORY_LIMIT))
    }
}

impl ScreenshotHistory {
    pub fn screenshots(path: impl Into<PathBuf>) -> Self {
        Self::new(path, None)
    }
}

impl<T: Serialize + DeserializeOwned> JsonLog<T> {
    pub fn new(path: impl Into<PathBuf>, limit: Option<usize>) -> Self {
        Self {
            path: path.into(),
            limit,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries on disk; missing or unreadable files read as empty.
    pub fn load(&self) -> Vec<T> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %self.path.display(), "discarding unreadable history: {e}");
                Vec::new()
            }
        }
    }

    pub fn append(&self, entry: T) -> Result<()> {
        let mut entries = self.load();
        entries.push(entry);
        if let Some(limit) = self.limit {
            if entries.len() > limit {
                let excess = entries.len() - limit;
                entries.drain(..excess);
            }
        }
        self.write(&entries)
    }

    pub fn clear(&self) -> Result<()> {
        self.write(&[])
    }

    fn write(&self, entries: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

pub fn timestamp_now() -> String {
    chrono::Local::now().to_rfc3339()
}
