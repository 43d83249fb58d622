//! Command lines for the external wallpaper engine.
//!
//! Everything here is pure: the same settings and monitor map always produce
//! the same argument vector. Property overrides come out sorted by name because
//! they are stored in `BTreeMap`s.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::config::Settings;
use crate::models::{ClampMode, ScalingMode};

pub const XVFB_RUN: &str = "xvfb-run";

/// Frame rate used for one-shot screenshot renders.
pub const SCREENSHOT_FPS: u32 = 60;

const AUDIO_PROPERTIES: &[&str] = &[
    "volume",
    "music",
    "sound",
    "sounds",
    "bell",
    "audio",
    "mute",
    "musicvolume",
    "soundvolume",
    "audiovolume",
];

/// Whether a wallpaper property controls audio. Silent mode suppresses these.
pub fn is_audio_property(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    AUDIO_PROPERTIES.contains(&name.as_str()) || name.ends_with("volume")
}

/// A program, its arguments, and the environment changes the child needs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env_remove: Vec<String>,
    pub env_set: Vec<(String, String)>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    fn flag(&mut self, flag: &str, value: impl ToString) -> &mut Self {
        self.args.push(flag.to_string());
        self.args.push(value.to_string());
        self
    }

    /// The long-running playback invocation for every screen in `monitors`.
    pub fn playback(settings: &Settings, monitors: &BTreeMap<String, String>) -> Self {
        let mut cmd = Self::new(&settings.wallpaper_engine);
        cmd.args = playback_args(settings, monitors);
        cmd
    }

    /// One-shot render of `wallpaper` into `output`, optionally under a
    /// virtual framebuffer.
    pub fn screenshot(settings: &Settings, wallpaper: &str, output: &Path, xvfb: bool) -> Self {
        let res = settings.screenshot_resolution;
        let mut cmd = if xvfb {
            let mut cmd = Self::new(XVFB_RUN);
            cmd.arg("-a")
                .flag("-s", format!("-screen 0 {res}x{res}x24 +extension GLX"))
                .arg(&settings.wallpaper_engine);
            for var in ["WAYLAND_DISPLAY", "WAYLAND_SOCKET"] {
                cmd.env_remove.push(var.into());
            }
            for (key, value) in [
                ("XDG_SESSION_TYPE", "x11"),
                ("GDK_BACKEND", "x11"),
                ("QT_QPA_PLATFORM", "xcb"),
                ("SDL_VIDEODRIVER", "x11"),
                ("LIBGL_ALWAYS_SOFTWARE", "1"),
            ] {
                cmd.env_set.push((key.into(), value.into()));
            }
            cmd
        } else {
            Self::new(&settings.wallpaper_engine)
        };

        cmd.flag("--screenshot", output.display())
            .flag("--screenshot-delay", settings.screenshot_delay)
            .arg("--silent")
            .flag("-f", SCREENSHOT_FPS)
            .arg(wallpaper);
        if !settings.assets_dir.is_empty() {
            cmd.flag("--assets-dir", &settings.assets_dir);
        }
        // without an explicit window the engine picks a tiny default size
        cmd.flag("--window", format!("0x0x{res}x{res}"));
        cmd
    }

    /// Build the process. The caller decides where stdio goes.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &self.env_set {
            cmd.env(key, value);
        }
        cmd
    }

    pub fn contains_pair(&self, flag: &str, value: &str) -> bool {
        self.args
            .windows(2)
            .any(|pair| pair[0] == flag && pair[1] == value)
    }
}

impl std::fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

pub fn playback_args(settings: &Settings, monitors: &BTreeMap<String, String>) -> Vec<String> {
    let mut cmd = EngineCommand::default();

    for (screen, wallpaper) in monitors {
        cmd.flag("--screen-root", screen).flag("--bg", wallpaper);
    }

    cmd.flag("-f", settings.fps);

    if settings.silence {
        cmd.arg("--silent");
    } else {
        cmd.flag("--volume", settings.volume);
    }

    if settings.scaling != ScalingMode::Default {
        cmd.flag("--scaling", settings.scaling);
    }
    if settings.clamp != ClampMode::Clamp {
        cmd.flag("--clamp", settings.clamp);
    }

    for (enabled, flag) in [
        (settings.no_fullscreen_pause, "--no-fullscreen-pause"),
        (settings.disable_mouse, "--disable-mouse"),
        (settings.no_automute, "--noautomute"),
        (settings.no_audio_processing, "--no-audio-processing"),
        (settings.disable_parallax, "--disable-parallax"),
        (settings.disable_particles, "--disable-particles"),
        (settings.fullscreen_pause_only_active, "--fullscreen-pause-only-active"),
    ] {
        if enabled {
            cmd.arg(flag);
        }
    }

    for appid in settings.ignored_appids() {
        cmd.flag("--fullscreen-pause-ignore-appid", appid);
    }

    if !settings.assets_dir.is_empty() {
        cmd.flag("--assets-dir", &settings.assets_dir);
    }

    let mut seen = std::collections::BTreeSet::new();
    for wallpaper in monitors.values() {
        if !seen.insert(wallpaper) {
            continue;
        }
        let Some(props) = settings.properties.get(wallpaper) else {
            continue;
        };
        for (name, value) in props {
            if settings.silence && is_audio_property(name) {
                continue;
            }
            cmd.flag("--set-property", format!("{name}={}", value.to_arg()));
        }
    }

    cmd.args
}

/// Executable basename, used to find the engine among a launcher's children
/// and for the kill sweep.
pub fn engine_name(settings: &Settings) -> String {
    Path::new(&settings.wallpaper_engine)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| settings.wallpaper_engine.clone())
}

/// How long a capture may run before it is killed. Software rendering under
/// a virtual framebuffer is far slower, so it gets a much larger budget.
pub fn screenshot_timeout(settings: &Settings, xvfb: bool) -> Duration {
    let frames = u64::from(settings.screenshot_delay);
    let base = Duration::from_secs(20)
        + Duration::from_millis(frames * 1000 / u64::from(SCREENSHOT_FPS));
    if !xvfb {
        return base;
    }
    let res = u64::from(settings.screenshot_resolution.max(1));
    // scale with pixel count relative to 1080p, never below 6x
    let factor = ((res * res) / (1920 * 1080)).max(6) as u32;
    base * factor
}

/// Locate an executable on `PATH`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PropertyValue;

    fn monitors(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(s, w)| (s.to_string(), w.to_string()))
            .collect()
    }

    #[test]
    fn test_silent_single_screen() {
        let settings = Settings {
            fps: 30,
            silence: true,
            ..Default::default()
        };
        let cmd = EngineCommand::playback(&settings, &monitors(&[("eDP-1", "123")]));

        assert_eq!(cmd.program, "linux-wallpaperengine");
        assert!(cmd.contains_pair("--screen-root", "eDP-1"));
        assert!(cmd.contains_pair("--bg", "123"));
        assert!(cmd.contains_pair("-f", "30"));
        assert!(cmd.args.contains(&"--silent".to_string()));
        assert!(!cmd.args.contains(&"--volume".to_string()));
    }

    #[test]
    fn test_default_flags() {
        let settings = Settings::default();
        let args = playback_args(&settings, &monitors(&[("DP-1", "42")]));
        assert_eq!(
            args,
            vec!["--screen-root", "DP-1", "--bg", "42", "-f", "30", "--volume", "50"]
        );
    }

    #[test]
    fn test_all_optional_flags() {
        let settings = Settings {
            scaling: ScalingMode::Fill,
            clamp: ClampMode::Border,
            no_fullscreen_pause: true,
            disable_mouse: true,
            no_automute: true,
            no_audio_processing: true,
            disable_parallax: true,
            disable_particles: true,
            fullscreen_pause_only_active: true,
            fullscreen_pause_ignore_appids: "firefox,mpv".into(),
            assets_dir: "/opt/assets".into(),
            ..Default::default()
        };
        let cmd = EngineCommand::playback(&settings, &monitors(&[("DP-1", "42")]));

        assert!(cmd.contains_pair("--scaling", "fill"));
        assert!(cmd.contains_pair("--clamp", "border"));
        for flag in [
            "--no-fullscreen-pause",
            "--disable-mouse",
            "--noautomute",
            "--no-audio-processing",
            "--disable-parallax",
            "--disable-particles",
            "--fullscreen-pause-only-active",
        ] {
            assert!(cmd.args.contains(&flag.to_string()), "missing {flag}");
        }
        assert!(cmd.contains_pair("--fullscreen-pause-ignore-appid", "firefox"));
        assert!(cmd.contains_pair("--fullscreen-pause-ignore-appid", "mpv"));
        assert!(cmd.contains_pair("--assets-dir", "/opt/assets"));
    }

    #[test]
    fn test_multi_screen_and_properties_are_deterministic() {
        let mut settings = Settings::default();
        let props = settings.properties.entry("42".into()).or_default();
        props.insert("speed".into(), PropertyValue::Float(1.5));
        props.insert("bloom".into(), PropertyValue::Bool(true));
        props.insert("color".into(), PropertyValue::List(vec![
            PropertyValue::Float(0.1),
            PropertyValue::Float(0.2),
        ]));
        // not active, must not appear
        settings
            .properties
            .entry("99".into())
            .or_default()
            .insert("rain".into(), PropertyValue::Int(1));

        let map = monitors(&[("HDMI-A-1", "42"), ("DP-1", "42")]);
        let first = playback_args(&settings, &map);
        let second = playback_args(&settings, &map);
        assert_eq!(first, second);

        let props: Vec<&String> = first
            .windows(2)
            .filter(|pair| pair[0] == "--set-property")
            .map(|pair| &pair[1])
            .collect();
        // one set per wallpaper, sorted by property name
        assert_eq!(props, vec!["bloom=1", "color=0.1,0.2", "speed=1.500000"]);
        assert_eq!(&first[..4], &["--screen-root", "DP-1", "--bg", "42"]);
    }

    #[test]
    fn test_silent_mode_suppresses_audio_properties() {
        let mut settings = Settings {
            silence: true,
            ..Default::default()
        };
        let props = settings.properties.entry("7".into()).or_default();
        for name in ["Volume", "music", "SOUND", "bell", "MusicVolume", "rainvolume"] {
            props.insert(name.into(), PropertyValue::Int(100));
        }
        props.insert("clouds".into(), PropertyValue::Bool(false));

        let args = playback_args(&settings, &monitors(&[("DP-1", "7")]));
        let sets: Vec<&String> = args
            .windows(2)
            .filter(|pair| pair[0] == "--set-property")
            .map(|pair| &pair[1])
            .collect();
        assert_eq!(sets, vec!["clouds=0"]);

        // audible mode passes them through
        settings.silence = false;
        let args = playback_args(&settings, &monitors(&[("DP-1", "7")]));
        assert!(args.contains(&"music=100".to_string()));
    }

    #[test]
    fn test_is_audio_property() {
        assert!(is_audio_property("volume"));
        assert!(is_audio_property("MUSIC"));
        assert!(is_audio_property("ambientvolume"));
        assert!(!is_audio_property("particles"));
        assert!(!is_audio_property("soundtrack_visualizer_color"));
    }

    #[test]
    fn test_screenshot_command_direct() {
        let settings = Settings {
            assets_dir: "/opt/assets".into(),
            ..Default::default()
        };
        let cmd = EngineCommand::screenshot(&settings, "123", Path::new("/tmp/shot.png"), false);

        assert_eq!(cmd.program, "linux-wallpaperengine");
        assert_eq!(
            cmd.args,
            vec![
                "--screenshot",
                "/tmp/shot.png",
                "--screenshot-delay",
                "20",
                "--silent",
                "-f",
                "60",
                "123",
                "--assets-dir",
                "/opt/assets",
                "--window",
                "0x0x1920x1920",
            ]
        );
        assert!(cmd.env_set.is_empty());
    }

    #[test]
    fn test_screenshot_command_xvfb() {
        let settings = Settings {
            screenshot_resolution: 1024,
            ..Default::default()
        };
        let cmd = EngineCommand::screenshot(&settings, "123", Path::new("/tmp/shot.png"), true);

        assert_eq!(cmd.program, "xvfb-run");
        assert_eq!(
            &cmd.args[..4],
            &["-a", "-s", "-screen 0 1024x1024x24 +extension GLX", "linux-wallpaperengine"]
        );
        assert!(cmd.contains_pair("--window", "0x0x1024x1024"));
        assert!(cmd.env_remove.contains(&"WAYLAND_DISPLAY".to_string()));
        assert!(cmd
            .env_set
            .contains(&("LIBGL_ALWAYS_SOFTWARE".to_string(), "1".to_string())));
    }

    #[test]
    fn test_screenshot_timeout_scales_under_xvfb() {
        let settings = Settings::default();
        let direct = screenshot_timeout(&settings, false);
        let xvfb = screenshot_timeout(&settings, true);
        assert!(direct >= Duration::from_secs(20));
        assert!(xvfb >= direct * 6);
    }

    #[test]
    fn test_display_quotes_arguments() {
        let mut cmd = EngineCommand::new("linux-wallpaperengine");
        cmd.arg("--assets-dir").arg("/home/me/My Assets").arg("-f").arg("30");
        assert_eq!(
            cmd.to_string(),
            "linux-wallpaperengine --assets-dir '/home/me/My Assets' -f 30"
        );
    }

    #[test]
    fn test_engine_name() {
        let settings = Settings {
            wallpaper_engine: "/usr/local/bin/linux-wallpaperengine".into(),
            ..Default::default()
        };
        assert_eq!(engine_name(&settings), "linux-wallpaperengine");
        assert_eq!(engine_name(&Settings::default()), "linux-wallpaperengine");
    }
}
