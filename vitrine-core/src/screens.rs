use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, VitrineError};

/// Source of connected output names (`DP-1`, `eDP-1`, ...).
#[async_trait]
pub trait ScreenEnumerator: Send + Sync {
    /// Connected screens. The list is cached; `refresh` forces a new query.
    async fn screens(&self, refresh: bool) -> Vec<String>;
}

/// Queries the running compositor or X server, caching the result.
#[derive(Default)]
pub struct DisplayScreens {
    cache: Mutex<Option<Vec<String>>>,
}

impl DisplayScreens {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScreenEnumerator for DisplayScreens {
    async fn screens(&self, refresh: bool) -> Vec<String> {
        let mut cache = self.cache.lock().await;
        if !refresh {
            if let Some(screens) = cache.as_ref() {
                return screens.clone();
            }
        }

        let screens = match detect_screens().await {
            Ok(screens) => screens,
            Err(e) => {
                warn!("screen detection failed: {e}");
                Vec::new()
            }
        };
        debug!(?screens, "screens detected");
        *cache = Some(screens.clone());
        screens
    }
}

/// Fixed screen list, settable at runtime.
#[derive(Default)]
pub struct StaticScreens {
    screens: std::sync::Mutex<Vec<String>>,
}

impl StaticScreens {
    pub fn new<S: Into<String>>(screens: impl IntoIterator<Item = S>) -> Self {
        Self {
            screens: std::sync::Mutex::new(screens.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set<S: Into<String>>(&self, screens: impl IntoIterator<Item = S>) {
        let mut guard = self.screens.lock().unwrap_or_else(|p| p.into_inner());
        *guard = screens.into_iter().map(Into::into).collect();
    }
}

#[async_trait]
impl ScreenEnumerator for StaticScreens {
    async fn screens(&self, _refresh: bool) -> Vec<String> {
        self.screens.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Ask Hyprland first, then xrandr.
pub async fn detect_screens() -> Result<Vec<String>> {
    match run(&["hyprctl", "monitors", "-j"]).await {
        Ok(json) => return parse_hyprctl(&json),
        Err(e) => debug!("hyprctl unavailable: {e}"),
    }
    let text = run(&["xrandr", "--query"]).await?;
    Ok(parse_xrandr(&text))
}

async fn run(argv: &[&str]) -> Result<String> {
    let output = Command::new(argv[0])
        .args(&argv[1..])
        .output()
        .await
        .map_err(|e| VitrineError::Screens(format!("failed to run {}: {e}", argv[0])))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VitrineError::Screens(format!("{} failed: {stderr}", argv[0])));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn parse_hyprctl(json: &str) -> Result<Vec<String>> {
    let raw: Vec<HyprMonitor> = serde_json::from_str(json)?;
    Ok(raw.into_iter().map(|m| m.name).collect())
}

fn parse_xrandr(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            (parts.next() == Some("connected")).then(|| name.to_string())
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct HyprMonitor {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOCK_MONITORS: &str = r#"[
        {
            "id": 0,
            "name": "DP-1",
            "description": "Dell U2720Q",
            "width": 3840,
            "height": 2160,
            "scale": 1.5,
            "focused": true
        },
        {
            "id": 1,
            "name": "HDMI-A-1",
            "description": "LG 27GL850",
            "width": 2560,
            "height": 1440,
            "scale": 1.0,
            "focused": false
        }
    ]"#;

    const MOCK_XRANDR: &str = "\
Screen 0: minimum 8 x 8, current 3840 x 1080, maximum 32767 x 32767
eDP-1 connected primary 1920x1080+0+0 (normal left inverted right x axis y axis) 344mm x 194mm
   1920x1080     60.02*+
HDMI-1 disconnected (normal left inverted right x axis y axis)
DP-2 connected 1920x1080+1920+0 (normal left inverted right x axis y axis) 527mm x 296mm
   1920x1080     60.00*+
";

    #[test]
    fn test_parse_hyprctl() {
        let screens = parse_hyprctl(MOCK_MONITORS).unwrap();
        assert_eq!(screens, vec!["DP-1", "HDMI-A-1"]);
    }

    #[test]
    fn test_parse_xrandr() {
        let screens = parse_xrandr(MOCK_XRANDR);
        assert_eq!(screens, vec!["eDP-1", "DP-2"]);
    }

    #[tokio::test]
    async fn test_static_screens() {
        let screens = StaticScreens::new(["DP-1", "DP-2"]);
        assert_eq!(screens.screens(false).await, vec!["DP-1", "DP-2"]);
        screens.set(["DP-2"]);
        assert_eq!(screens.screens(true).await, vec!["DP-2"]);
    }
}
