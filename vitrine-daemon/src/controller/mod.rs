pub mod engine;
pub mod screenshot;
pub mod supervisor;

use std::path::{Path, PathBuf};

use tokio::sync::oneshot;

use vitrine_core::models::{EngineStatus, PropertyValue, ScreenshotRecord};

pub type Reply<T> = oneshot::Sender<Result<T, String>>;

pub enum DaemonCommand {
    Status {
        respond: oneshot::Sender<EngineStatus>,
    },
    Apply {
        wallpaper: String,
        screen: Option<String>,
        screens: Option<Vec<String>>,
        respond: Reply<()>,
    },
    StopScreen {
        screen: String,
        respond: Reply<()>,
    },
    Stop {
        respond: Reply<()>,
    },
    Restart {
        respond: Reply<Option<u32>>,
    },
    Screenshot {
        wallpaper: String,
        output: Option<PathBuf>,
        respond: Reply<ScreenshotRecord>,
    },
    SetSetting {
        key: String,
        value: serde_json::Value,
        respond: Reply<()>,
    },
    SetProperty {
        wallpaper: String,
        name: String,
        value: PropertyValue,
        respond: Reply<()>,
    },
    ClearProperties {
        wallpaper: String,
        respond: Reply<()>,
    },
    TopologyChanged,
    RegisterTray {
        pid: u32,
    },
    Quit,
}

/// Last `lines` lines of a log file, or an empty string if it is unreadable.
pub fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = content.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
