use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::{debug, info, warn};

use vitrine_core::config::Settings;
use vitrine_core::engine::{engine_name, find_in_path, screenshot_timeout, EngineCommand, XVFB_RUN};
use vitrine_core::error::{Result, VitrineError};
use vitrine_core::history::{timestamp_now, ScreenshotHistory};
use vitrine_core::models::{ScreenshotRecord, TaskId};

use crate::sampler::SamplerHandle;

use super::log_tail;

pub const POLL_TICK: Duration = Duration::from_millis(100);

/// Unchanged-size ticks before a still-running capture counts as written.
const STABLE_TICKS: u32 = 2;

const INTERRUPT_GRACE: Duration = Duration::from_secs(2);
const TERMINATE_GRACE: Duration = Duration::from_secs(3);
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    /// The engine exited by itself.
    Exited,
    /// The output stopped growing and the engine was interrupted.
    Stable,
    /// The deadline passed and the engine was terminated.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub path: PathBuf,
    pub duration: Duration,
    pub size: u64,
    pub ended: CaptureEnd,
}

/// One screenshot run: spawn, poll, and verify.
pub struct Capture {
    command: EngineCommand,
    output: PathBuf,
    timeout: Duration,
    stderr_log: PathBuf,
    tick: Duration,
}

impl Capture {
    pub fn new(command: EngineCommand, output: PathBuf, timeout: Duration, stderr_log: PathBuf) -> Self {
        Self {
            command,
            output,
            timeout,
            stderr_log,
            tick: POLL_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run the capture to completion. `on_spawn` receives the pid of the
    /// process group leader as soon as it exists.
    ///
    /// Whichever of exit, size stability, or timeout comes first ends the
    /// poll; all three are judged by the same check on the output file.
    pub async fn run(&self, on_spawn: impl FnOnce(u32)) -> Result<CaptureReport> {
        match std::fs::remove_file(&self.output) {
            Ok(()) => debug!(path = %self.output.display(), "removed stale screenshot"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for path in [&self.output, &self.stderr_log] {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let stderr = std::fs::File::create(&self.stderr_log)?;

        let mut cmd = self.command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| VitrineError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        info!(pid, output = %self.output.display(), command = %self.command, "screenshot started");
        on_spawn(pid);

        let (ended, status) = self.poll(&mut child, pid, started).await?;
        let duration = started.elapsed();

        let size = file_size(&self.output);
        if size > 0 {
            info!(size, ?ended, secs = duration.as_secs_f64(), "screenshot captured");
            return Ok(CaptureReport {
                path: self.output.clone(),
                duration,
                size,
                ended,
            });
        }

        if ended == CaptureEnd::TimedOut {
            return Err(VitrineError::ScreenshotTimeout(self.timeout.as_secs()));
        }
        let status = status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown status".into());
        let tail = log_tail(&self.stderr_log, STDERR_TAIL_LINES);
        Err(VitrineError::Screenshot(format!(
            "engine {status} without writing {}\n{tail}",
            self.output.display()
        )))
    }

    async fn poll(
        &self,
        child: &mut Child,
        pid: u32,
        started: Instant,
    ) -> Result<(CaptureEnd, Option<ExitStatus>)> {
        let mut last_size = 0;
        let mut unchanged = 0;

        loop {
            if let Some(status) = child.try_wait()? {
                return Ok((CaptureEnd::Exited, Some(status)));
            }

            let size = file_size(&self.output);
            if size > 0 && size == last_size {
                unchanged += 1;
            } else {
                unchanged = 0;
                last_size = size;
            }
            if unchanged >= STABLE_TICKS {
                debug!(pid, size, "screenshot output stable, interrupting engine");
                let status = stop_group(child, pid, libc::SIGINT, INTERRUPT_GRACE).await;
                return Ok((CaptureEnd::Stable, status));
            }

            if started.elapsed() >= self.timeout {
                warn!(pid, timeout_secs = self.timeout.as_secs(), "screenshot timed out");
                let status = stop_group(child, pid, libc::SIGTERM, TERMINATE_GRACE).await;
                return Ok((CaptureEnd::TimedOut, status));
            }

            tokio::time::sleep(self.tick).await;
        }
    }
}

/// Signal the whole process group, then SIGKILL it if the leader outlives
/// `grace`.
async fn stop_group(child: &mut Child, pgid: u32, signal: libc::c_int, grace: Duration) -> Option<ExitStatus> {
    unsafe {
        libc::killpg(pgid as libc::pid_t, signal);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            unsafe {
                libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
            }
            child.wait().await.ok()
        }
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Default output location: `<dir>/<wallpaper>-<timestamp>.png`.
pub fn default_output(dir: &Path, wallpaper: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    dir.join(format!("{wallpaper}-{stamp}.png"))
}

/// Process-group leaders of captures still running. The engine sweep on
/// stop leaves these trees alone.
#[derive(Debug, Clone, Default)]
pub struct ActiveCaptures(Arc<Mutex<BTreeSet<u32>>>);

impl ActiveCaptures {
    pub fn insert(&self, pid: u32) {
        self.lock().insert(pid);
    }

    pub fn remove(&self, pid: u32) {
        self.lock().remove(&pid);
    }

    pub fn pids(&self) -> Vec<u32> {
        self.lock().iter().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A screenshot request with everything it needs captured up front, so it
/// can run detached from the controller.
pub struct ScreenshotJob {
    pub task: TaskId,
    pub settings: Settings,
    pub wallpaper: String,
    pub output: PathBuf,
    pub stderr_log: PathBuf,
    pub sampler: SamplerHandle,
    pub history: ScreenshotHistory,
    pub captures: ActiveCaptures,
}

impl ScreenshotJob {
    /// Capture, register the process as a sampler task for its lifetime, and
    /// record the result with its peak readings.
    pub async fn run(self) -> Result<ScreenshotRecord> {
        let xvfb = self.settings.prefer_xvfb && find_in_path(XVFB_RUN).is_some();
        if self.settings.prefer_xvfb && !xvfb {
            debug!("{XVFB_RUN} not found, capturing on the live display");
        }
        let command = EngineCommand::screenshot(&self.settings, &self.wallpaper, &self.output, xvfb);
        let timeout = screenshot_timeout(&self.settings, xvfb);
        let capture = Capture::new(command, self.output.clone(), timeout, self.stderr_log.clone());

        // under xvfb-run the group leader is the wrapper, not the engine
        let name = engine_name(&self.settings);
        let mut leader = None;
        let result = capture
            .run(|pid| {
                leader = Some(pid);
                self.captures.insert(pid);
                self.sampler.track_task(self.task, pid, Some(name.as_str()));
            })
            .await;
        if let Some(pid) = leader {
            self.captures.remove(pid);
        }
        let summary = self.sampler.finish_task(self.task).await.unwrap_or_default();

        let report = result?;
        let _ = std::fs::remove_file(&self.stderr_log);
        let record = ScreenshotRecord {
            wallpaper: self.wallpaper,
            path: report.path.display().to_string(),
            timestamp: timestamp_now(),
            duration_secs: report.duration.as_secs_f64(),
            peak_cpu: summary.peak_cpu,
            peak_memory_mb: summary.peak_memory_mb,
        };
        if let Err(e) = self.history.append(record.clone()) {
            warn!("failed to record screenshot history: {e}");
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::state::tests::FakeProbe;

    fn shell(script: &str) -> EngineCommand {
        let mut cmd = EngineCommand::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn capture(tmp: &Path, script: &str, timeout: Duration) -> Capture {
        let output = tmp.join("shot.png");
        let script = script.replace("OUT", &output.display().to_string());
        Capture::new(shell(&script), output, timeout, tmp.join("logs/shot.log"))
            .with_tick(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_exit_with_file_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let capture = capture(tmp.path(), "printf 'png-bytes' > OUT", Duration::from_secs(10));

        let mut spawned = None;
        let report = capture.run(|pid| spawned = Some(pid)).await.unwrap();
        assert!(spawned.is_some());
        assert_eq!(report.ended, CaptureEnd::Exited);
        assert_eq!(report.size, 9);
    }

    #[tokio::test]
    async fn test_exit_without_file_reports_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let capture = capture(
            tmp.path(),
            "echo 'scene.pkg not found' >&2; exit 1",
            Duration::from_secs(10),
        );

        let err = capture.run(|_| {}).await.unwrap_err();
        match err {
            VitrineError::Screenshot(message) => assert!(message.contains("scene.pkg not found")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_file_is_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let capture = capture(tmp.path(), ": > OUT", Duration::from_secs(10));
        assert!(matches!(capture.run(|_| {}).await, Err(VitrineError::Screenshot(_))));
    }

    #[tokio::test]
    async fn test_stable_output_interrupts_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let capture = capture(
            tmp.path(),
            "printf 'png-bytes' > OUT; sleep 30",
            Duration::from_secs(10),
        );

        let started = Instant::now();
        let report = capture.run(|_| {}).await.unwrap();
        assert_eq!(report.ended, CaptureEnd::Stable);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_without_output() {
        let tmp = tempfile::tempdir().unwrap();
        let capture = capture(tmp.path(), "sleep 30", Duration::from_millis(200));

        let err = capture.run(|_| {}).await.unwrap_err();
        assert!(matches!(err, VitrineError::ScreenshotTimeout(_)));
        assert!(err.to_string().contains("delay"));
    }

    #[tokio::test]
    async fn test_stale_output_is_removed_first() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("shot.png"), b"old").unwrap();
        let capture = capture(tmp.path(), "exit 0", Duration::from_secs(10));
        assert!(capture.run(|_| {}).await.is_err());
    }

    #[tokio::test]
    async fn test_job_records_history() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = tmp.path().join("fake-engine");
        // the output path follows --screenshot
        std::fs::write(
            &engine,
            "#!/bin/sh\nwhile [ \"$1\" != --screenshot ]; do shift; done\nprintf png > \"$2\"\n",
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let settings = Settings {
            wallpaper_engine: engine.display().to_string(),
            prefer_xvfb: false,
            ..Default::default()
        };
        let history = ScreenshotHistory::screenshots(tmp.path().join("shots.json"));
        let captures = ActiveCaptures::default();
        let sampler = SamplerHandle::new(Box::new(FakeProbe::default()));
        let job = ScreenshotJob {
            task: sampler.next_task_id(),
            settings,
            wallpaper: "123".into(),
            output: tmp.path().join("out/123.png"),
            stderr_log: tmp.path().join("logs/screenshot-task-1.log"),
            sampler,
            history: history.clone(),
            captures: captures.clone(),
        };

        let record = job.run().await.unwrap();
        assert_eq!(record.wallpaper, "123");
        assert!(record.path.ends_with("123.png"));
        assert_eq!(history.load(), vec![record]);
        assert!(captures.pids().is_empty());
        assert!(!tmp.path().join("logs/screenshot-task-1.log").exists());
    }

    #[tokio::test]
    async fn test_running_capture_is_listed() {
        let tmp = tempfile::tempdir().unwrap();
        let captures = ActiveCaptures::default();
        let capture = capture(tmp.path(), "sleep 30", Duration::from_millis(300));

        let listed = captures.clone();
        let run = capture.run(|pid| listed.insert(pid));
        let watcher = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            captures.pids()
        };
        let (result, during) = tokio::join!(run, watcher);
        assert!(result.is_err());
        assert_eq!(during.len(), 1);
    }

    #[test]
    fn test_default_output_name() {
        let path = default_output(Path::new("/tmp/shots"), "42");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("42-"));
        assert!(name.ends_with(".png"));
    }
}
