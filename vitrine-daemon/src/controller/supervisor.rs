use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, error, info, warn};

use vitrine_core::config::SettingsStore;
use vitrine_core::engine::{engine_name, EngineCommand};
use vitrine_core::error::{Result, VitrineError};
use vitrine_core::history::{timestamp_now, PlaybackHistory};
use vitrine_core::models::{EngineStatus, PlaybackRecord};
use vitrine_core::screens::ScreenEnumerator;

use crate::notify;
use crate::procs;
use crate::sampler::SamplerHandle;

use super::log_tail;
use super::screenshot::ActiveCaptures;

/// How long a freshly spawned engine must survive to count as started.
pub const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// How long the engine gets to exit after SIGTERM before it is killed.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

const LOG_TAIL_LINES: usize = 20;

/// The one running engine process.
struct EngineProcess {
    child: Child,
    pid: u32,
    command: EngineCommand,
    /// Held open for the lifetime of the process; closed on stop.
    _log: std::fs::File,
}

/// Keeps exactly one engine process in line with the settings and the
/// active-monitor map.
pub struct Supervisor {
    settings: Arc<SettingsStore>,
    screens: Arc<dyn ScreenEnumerator>,
    sampler: SamplerHandle,
    history: PlaybackHistory,
    log_path: PathBuf,
    process: Option<EngineProcess>,
    last_error: Option<String>,
    startup_grace: Duration,
    captures: ActiveCaptures,
}

impl Supervisor {
    pub fn new(
        settings: Arc<SettingsStore>,
        screens: Arc<dyn ScreenEnumerator>,
        sampler: SamplerHandle,
        history: PlaybackHistory,
        log_path: PathBuf,
    ) -> Self {
        Self {
            settings,
            screens,
            sampler,
            history,
            log_path,
            process: None,
            last_error: None,
            startup_grace: STARTUP_GRACE,
            captures: ActiveCaptures::default(),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Screenshot engines listed here survive the stray-engine sweep.
    pub fn with_captures(mut self, captures: ActiveCaptures) -> Self {
        self.captures = captures;
        self
    }

    /// Assign `wallpaper` to the target screens and restart the engine.
    ///
    /// Targets are `screens` if given, else `screen`, else the last used
    /// screen, else the first connected one.
    pub async fn apply(
        &mut self,
        wallpaper: &str,
        screen: Option<String>,
        screens: Option<Vec<String>>,
    ) -> Result<()> {
        if wallpaper.is_empty() {
            return Err(VitrineError::Engine("wallpaper id must not be empty".into()));
        }

        let targets = match (screens, screen) {
            (Some(list), _) if !list.is_empty() => list,
            (_, Some(one)) => vec![one],
            _ => {
                let last = self.settings.snapshot().last_screen;
                if !last.is_empty() {
                    vec![last]
                } else {
                    let live = self.screens.screens(false).await;
                    match live.into_iter().next() {
                        Some(first) => vec![first],
                        None => {
                            return Err(VitrineError::Engine(
                                "no target screen given and none connected".into(),
                            ))
                        }
                    }
                }
            }
        };

        let record_history = self.settings.update(|s| {
            for target in &targets {
                s.active_monitors.insert(target.clone(), wallpaper.to_string());
            }
            s.last_wallpaper = wallpaper.to_string();
            if let [only] = targets.as_slice() {
                s.last_screen = only.clone();
            }
            s.record_history
        })?;
        info!(wallpaper, screens = ?targets, "wallpaper applied");

        if record_history {
            let record = PlaybackRecord {
                wallpaper: wallpaper.to_string(),
                screens: targets,
                timestamp: timestamp_now(),
            };
            if let Err(e) = self.history.append(record) {
                warn!("failed to record playback history: {e}");
            }
        }

        self.restart_wallpapers().await.map(|_| ())
    }

    /// Remove one screen. The engine restarts with the remaining screens, or
    /// stops if none remain.
    pub async fn stop_screen(&mut self, screen: &str) -> Result<()> {
        let remaining = self.settings.update(|s| {
            s.active_monitors.remove(screen);
            s.active_monitors.len()
        })?;
        info!(screen, remaining, "screen stopped");

        if remaining == 0 {
            self.stop().await;
            Ok(())
        } else {
            self.restart_wallpapers().await.map(|_| ())
        }
    }

    /// Stop whatever runs, reconcile the monitor map with the connected
    /// screens, and launch one engine for all of them. Returns the engine pid,
    /// or `None` if there is nothing to show.
    pub async fn restart_wallpapers(&mut self) -> Result<Option<u32>> {
        self.stop().await;

        let live = self.screens.screens(false).await;
        let monitors = self.reconcile(&live)?;
        if monitors.is_empty() {
            debug!("no active monitors, engine stays stopped");
            return Ok(None);
        }

        match self.launch(&monitors).await {
            Ok(pid) => {
                self.last_error = None;
                Ok(Some(pid))
            }
            Err(e) => {
                self.report(&e).await;
                Err(e)
            }
        }
    }

    /// Idempotent. Terminates the tracked engine and sweeps up any stray
    /// engine processes the handle does not reach. Every sampler entry but
    /// the frontend is dropped; the tray registers itself again.
    pub async fn stop(&mut self) {
        self.sampler.untrack_all();

        if let Some(mut process) = self.process.take() {
            terminate(&mut process.child, process.pid).await;
            info!(pid = process.pid, "engine stopped");
        }

        let name = engine_name(&self.settings.snapshot());
        let spare = self.captures.pids();
        let swept = tokio::task::spawn_blocking(move || procs::kill_by_name(&name, &spare))
            .await
            .unwrap_or(0);
        if swept > 0 {
            info!(count = swept, "killed stray engine processes");
        }
    }

    pub fn current_command(&self) -> Option<String> {
        self.process.as_ref().map(|p| p.command.to_string())
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn status(&mut self) -> EngineStatus {
        let running = match self.process.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        };
        EngineStatus {
            running,
            pid: self.pid(),
            command: self.current_command(),
            active_monitors: self.settings.snapshot().active_monitors,
            last_error: self.last_error.clone(),
        }
    }

    /// Drop entries for disconnected screens, persisting only if something
    /// changed. An empty screen list means detection is unavailable and the
    /// map is left alone.
    fn reconcile(&self, live: &[String]) -> Result<BTreeMap<String, String>> {
        let current = self.settings.snapshot().active_monitors;
        if live.is_empty() {
            if !current.is_empty() {
                warn!("no screens detected, keeping saved monitor map");
            }
            return Ok(current);
        }

        let (kept, dropped) = reconcile_monitors(&current, live);
        if !dropped.is_empty() {
            info!(dropped = ?dropped, "removing disconnected screens");
            self.settings.update(|s| s.active_monitors = kept.clone())?;
        }
        Ok(kept)
    }

    async fn launch(&mut self, monitors: &BTreeMap<String, String>) -> Result<u32> {
        let settings = self.settings.snapshot();
        let command = EngineCommand::playback(&settings, monitors);

        if let Some(dir) = self.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::File::create(&self.log_path)?;

        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?));

        let mut child = cmd.spawn().map_err(|source| VitrineError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        info!(pid, screens = monitors.len(), command = %command, "engine launched");

        tokio::time::sleep(self.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            let log_tail = log_tail(&self.log_path, LOG_TAIL_LINES);
            return Err(VitrineError::EarlyExit {
                status: status.to_string(),
                log_tail,
            });
        }

        self.sampler.track_backend(pid, &engine_name(&settings));
        self.process = Some(EngineProcess {
            child,
            pid,
            command,
            _log: log,
        });
        Ok(pid)
    }

    async fn report(&mut self, e: &VitrineError) {
        error!("engine failed to start: {e}");
        self.last_error = Some(e.to_string());
        if self.settings.snapshot().notifications {
            notify::desktop("Wallpaper engine failed", &e.to_string()).await;
        }
    }
}

/// Split `current` into entries whose screen is connected and the screens
/// that are not.
pub fn reconcile_monitors(
    current: &BTreeMap<String, String>,
    live: &[String],
) -> (BTreeMap<String, String>, Vec<String>) {
    let mut kept = BTreeMap::new();
    let mut dropped = Vec::new();
    for (screen, wallpaper) in current {
        if live.iter().any(|s| s == screen) {
            kept.insert(screen.clone(), wallpaper.clone());
        } else {
            dropped.push(screen.clone());
        }
    }
    (kept, dropped)
}

/// SIGTERM, then SIGKILL if the process outlives the timeout.
async fn terminate(child: &mut Child, pid: u32) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    match tokio::time::timeout(TERMINATE_TIMEOUT, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, "engine ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(pid, "failed to kill engine: {e}");
            }
        }
    }
}
