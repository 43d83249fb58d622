use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    #[default]
    Default,
    Stretch,
    Fit,
    Fill,
}

impl ScalingMode {
    pub const ALL: &[ScalingMode] = &[
        ScalingMode::Default,
        ScalingMode::Stretch,
        ScalingMode::Fit,
        ScalingMode::Fill,
    ];
}

impl std::fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Stretch => write!(f, "stretch"),
            Self::Fit => write!(f, "fit"),
            Self::Fill => write!(f, "fill"),
        }
    }
}

impl std::str::FromStr for ScalingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "stretch" => Ok(Self::Stretch),
            "fit" => Ok(Self::Fit),
            "fill" => Ok(Self::Fill),
            other => Err(format!("unknown scaling mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClampMode {
    #[default]
    Clamp,
    Border,
    Repeat,
}

impl std::fmt::Display for ClampMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clamp => write!(f, "clamp"),
            Self::Border => write!(f, "border"),
            Self::Repeat => write!(f, "repeat"),
        }
    }
}

impl std::str::FromStr for ClampMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "clamp" => Ok(Self::Clamp),
            "border" => Ok(Self::Border),
            "repeat" => Ok(Self::Repeat),
            other => Err(format!("unknown clamp mode: {other}")),
        }
    }
}

/// A user override for one wallpaper property, passed to the engine as
/// `--set-property name=value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Render the value the way the engine parses it on the command line.
    pub fn to_arg(&self) -> String {
        match self {
            Self::Bool(true) => "1".into(),
            Self::Bool(false) => "0".into(),
            Self::Int(n) => n.to_string(),
            Self::Float(x) => format!("{x:.6}"),
            Self::Text(s) => s.clone(),
            Self::List(items) => items
                .iter()
                .map(|item| match item {
                    Self::Float(x) => x.to_string(),
                    other => other.to_arg(),
                })
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Fixed processes the sampler knows about. Screenshot captures are tracked
/// separately under a [`TaskId`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Frontend,
    Backend,
    Tray,
}

impl Category {
    pub const ALL: &[Category] = &[Category::Frontend, Category::Backend, Category::Tray];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frontend => write!(f, "frontend"),
            Self::Backend => write!(f, "backend"),
            Self::Tray => write!(f, "tray"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryWindow {
    pub cpu: Vec<f32>,
    pub memory_mb: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub status: String,
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub threads: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thread_names: Vec<String>,
    pub history: HistoryWindow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalSample {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub threads: usize,
    pub history: HistoryWindow,
}

/// One sampler tick, delivered to every subscriber.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: String,
    pub categories: BTreeMap<Category, ProcessSample>,
    pub tasks: BTreeMap<TaskId, ProcessSample>,
    pub total: TotalSample,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackRecord {
    pub wallpaper: String,
    pub screens: Vec<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenshotRecord {
    pub wallpaper: String,
    pub path: String,
    pub timestamp: String,
    pub duration_secs: f64,
    pub peak_cpu: f32,
    pub peak_memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: Option<String>,
    pub active_monitors: BTreeMap<String, String>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_value_formatting() {
        assert_eq!(PropertyValue::Bool(true).to_arg(), "1");
        assert_eq!(PropertyValue::Bool(false).to_arg(), "0");
        assert_eq!(PropertyValue::Int(42).to_arg(), "42");
        assert_eq!(PropertyValue::Float(0.5).to_arg(), "0.500000");
        assert_eq!(PropertyValue::Text("blue".into()).to_arg(), "blue");

        let color = PropertyValue::List(vec![
            PropertyValue::Float(0.1),
            PropertyValue::Float(0.2),
            PropertyValue::Int(1),
        ]);
        assert_eq!(color.to_arg(), "0.1,0.2,1");
    }

    #[test]
    fn test_property_value_untagged_parse() {
        let v: PropertyValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, PropertyValue::Bool(true));
        let v: PropertyValue = serde_json::from_str("7").unwrap();
        assert_eq!(v, PropertyValue::Int(7));
        let v: PropertyValue = serde_json::from_str("0.25").unwrap();
        assert_eq!(v, PropertyValue::Float(0.25));
        let v: PropertyValue = serde_json::from_str(r#"[1, 0.5]"#).unwrap();
        assert_eq!(
            v,
            PropertyValue::List(vec![PropertyValue::Int(1), PropertyValue::Float(0.5)])
        );
    }

    #[test]
    fn test_mode_parse_and_display() {
        for mode in ScalingMode::ALL {
            let parsed: ScalingMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, *mode);
        }
        assert_eq!("repeat".parse::<ClampMode>(), Ok(ClampMode::Repeat));
        assert!("tile".parse::<ClampMode>().is_err());
    }

    #[test]
    fn test_snapshot_serializes_category_keys() {
        let mut snapshot = Snapshot::default();
        snapshot.categories.insert(
            Category::Backend,
            ProcessSample {
                pid: 10,
                name: "linux-wallpaperengine".into(),
                status: "Sleeping".into(),
                cpu_percent: 3.5,
                memory_mb: 120.0,
                threads: 12,
                thread_names: Vec::new(),
                history: HistoryWindow::default(),
            },
        );
        snapshot.tasks.insert(TaskId(3), snapshot.categories[&Category::Backend].clone());

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(r#""backend":{"pid":10"#));
        assert!(json.contains(r#""3":{"pid":10"#));
        assert!(!json.contains("thread_names"));
    }
}
