use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use vitrine_core::config::SettingsStore;
use vitrine_core::error::{Result, VitrineError};
use vitrine_core::history::ScreenshotHistory;
use vitrine_core::models::{Category, PropertyValue};
use vitrine_core::paths::VitrinePaths;
use vitrine_core::screens::ScreenEnumerator;

use crate::notify;
use crate::sampler::SamplerHandle;

use super::screenshot::{default_output, ActiveCaptures, ScreenshotJob};
use super::supervisor::Supervisor;
use super::DaemonCommand;

/// Settings that never change the engine command line.
const NON_PLAYBACK_KEYS: &[&str] = &[
    "lastWallpaper",
    "lastScreen",
    "recordHistory",
    "screenshotDelay",
    "screenshotResolution",
    "preferXvfb",
    "notifications",
];

pub fn affects_playback(key: &str) -> bool {
    !NON_PLAYBACK_KEYS.contains(&key)
}

/// Owns the supervisor and serializes every state change through one
/// command loop.
pub struct Controller {
    supervisor: Supervisor,
    settings: Arc<SettingsStore>,
    screens: Arc<dyn ScreenEnumerator>,
    sampler: SamplerHandle,
    paths: VitrinePaths,
    screenshots: ScreenshotHistory,
    captures: ActiveCaptures,
}

impl Controller {
    pub fn new(
        supervisor: Supervisor,
        settings: Arc<SettingsStore>,
        screens: Arc<dyn ScreenEnumerator>,
        sampler: SamplerHandle,
        paths: VitrinePaths,
    ) -> Self {
        let screenshots = ScreenshotHistory::screenshots(paths.screenshot_history_file());
        let captures = ActiveCaptures::default();
        Self {
            supervisor: supervisor.with_captures(captures.clone()),
            settings,
            screens,
            sampler,
            paths,
            screenshots,
            captures,
        }
    }

    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<DaemonCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !self.settings.snapshot().active_monitors.is_empty() {
            info!("restoring saved wallpapers");
            // failures are already logged and reported by the supervisor
            let _ = self.supervisor.restart_wallpapers().await;
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("command channel closed");
                        break;
                    };
                    match cmd {
                        DaemonCommand::Status { respond } => {
                            let _ = respond.send(self.supervisor.status());
                        }
                        DaemonCommand::Apply { wallpaper, screen, screens, respond } => {
                            let result = self.supervisor.apply(&wallpaper, screen, screens).await;
                            let _ = respond.send(result.map_err(|e| e.to_string()));
                        }
                        DaemonCommand::StopScreen { screen, respond } => {
                            let result = self.supervisor.stop_screen(&screen).await;
                            let _ = respond.send(result.map_err(|e| e.to_string()));
                        }
                        DaemonCommand::Stop { respond } => {
                            let result = self.stop_all().await;
                            let _ = respond.send(result.map_err(|e| e.to_string()));
                        }
                        DaemonCommand::Restart { respond } => {
                            let result = self.supervisor.restart_wallpapers().await;
                            let _ = respond.send(result.map_err(|e| e.to_string()));
                        }
                        DaemonCommand::Screenshot { wallpaper, output, respond } => {
                            match self.screenshot_job(wallpaper, output) {
                                Ok(job) => {
                                    let notifications = self.settings.snapshot().notifications;
                                    tokio::spawn(async move {
                                        let result = job.run().await;
                                        if let Err(e) = &result {
                                            warn!("screenshot failed: {e}");
                                            if notifications {
                                                notify::desktop("Screenshot failed", &e.to_string()).await;
                                            }
                                        }
                                        let _ = respond.send(result.map_err(|e| e.to_string()));
                                    });
                                }
                                Err(e) => {
                                    let _ = respond.send(Err(e.to_string()));
                                }
                            }
                        }
                        DaemonCommand::SetSetting { key, value, respond } => {
                            let result = self.settings.set(&key, value);
                            if result.is_ok() {
                                info!(key, "setting changed");
                                if affects_playback(&key) {
                                    self.restart_if_running().await;
                                }
                            }
                            let _ = respond.send(result.map_err(|e| e.to_string()));
                        }
                        DaemonCommand::SetProperty { wallpaper, name, value, respond } => {
                            let result = self.set_property(&wallpaper, &name, value).await;
                            let _ = respond.send(result.map_err(|e| e.to_string()));
                        }
                        DaemonCommand::ClearProperties { wallpaper, respond } => {
                            let result = self.clear_properties(&wallpaper).await;
                            let _ = respond.send(result.map_err(|e| e.to_string()));
                        }
                        DaemonCommand::TopologyChanged => {
                            let live = self.screens.screens(true).await;
                            info!(screens = ?live, "monitor topology changed");
                            if !self.settings.snapshot().active_monitors.is_empty() {
                                let _ = self.supervisor.restart_wallpapers().await;
                            }
                        }
                        DaemonCommand::RegisterTray { pid } => {
                            // the tray repeats this after every engine stop
                            debug!(pid, "tray registered");
                            self.sampler.track(Category::Tray, pid);
                        }
                        DaemonCommand::Quit => {
                            info!("quit command received");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.supervisor.stop().await;
    }

    /// Stop playback everywhere and forget the monitor assignments.
    async fn stop_all(&mut self) -> Result<()> {
        self.supervisor.stop().await;
        self.settings.update(|s| s.active_monitors.clear())?;
        info!("all wallpapers stopped");
        Ok(())
    }

    async fn restart_if_running(&mut self) {
        if self.supervisor.has_process() {
            let _ = self.supervisor.restart_wallpapers().await;
        }
    }

    async fn set_property(&mut self, wallpaper: &str, name: &str, value: PropertyValue) -> Result<()> {
        if name.is_empty() || name.contains('=') {
            return Err(VitrineError::Config(format!("invalid property name: {name:?}")));
        }
        self.settings.update(|s| {
            s.properties
                .entry(wallpaper.to_string())
                .or_default()
                .insert(name.to_string(), value);
        })?;
        info!(wallpaper, name, "property set");
        self.restart_if_active(wallpaper).await;
        Ok(())
    }

    async fn clear_properties(&mut self, wallpaper: &str) -> Result<()> {
        let removed = self.settings.update(|s| s.properties.remove(wallpaper).is_some())?;
        if removed {
            info!(wallpaper, "properties cleared");
            self.restart_if_active(wallpaper).await;
        }
        Ok(())
    }

    async fn restart_if_active(&mut self, wallpaper: &str) {
        let active = self
            .settings
            .snapshot()
            .active_monitors
            .values()
            .any(|w| w == wallpaper);
        if active {
            self.restart_if_running().await;
        }
    }

    fn screenshot_job(&self, wallpaper: String, output: Option<std::path::PathBuf>) -> Result<ScreenshotJob> {
        let settings = self.settings.snapshot();
        if !settings.active_monitors.values().any(|w| *w == wallpaper) {
            return Err(VitrineError::Screenshot(format!(
                "wallpaper {wallpaper} is not active on any screen"
            )));
        }
        let output = output.unwrap_or_else(|| default_output(&self.paths.screenshots_dir(), &wallpaper));
        let task = self.sampler.next_task_id();
        Ok(ScreenshotJob {
            task,
            settings,
            wallpaper,
            output,
            stderr_log: self.paths.logs_dir().join(format!("screenshot-{task}.log")),
            sampler: self.sampler.clone(),
            history: self.screenshots.clone(),
            captures: self.captures.clone(),
        })
    }
}
