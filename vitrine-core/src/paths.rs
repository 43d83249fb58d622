use std::path::PathBuf;

use crate::error::{Result, VitrineError};

#[derive(Debug, Clone)]
pub struct VitrinePaths {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl VitrinePaths {
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| VitrineError::Config("cannot resolve XDG config dir".into()))?
            .join("vitrine");

        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| VitrineError::Config("cannot resolve XDG cache dir".into()))?
            .join("vitrine");

        Ok(Self {
            config_dir,
            cache_dir,
        })
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.config_dir.join("history.json")
    }

    pub fn screenshot_history_file(&self) -> PathBuf {
        self.config_dir.join("screenshot_history.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }

    /// Sink for the running engine's stdout and stderr, truncated on every launch.
    pub fn engine_log(&self) -> PathBuf {
        self.logs_dir().join("engine.log")
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.cache_dir.join("screenshots")
    }

    pub fn socket_path() -> PathBuf {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/vitrine-{uid}.sock"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.cache_dir,
            &self.logs_dir(),
            &self.screenshots_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
