#[derive(Debug, thiserror::Error)]
pub enum VitrineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown setting: {0}")]
    UnknownSetting(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine exited during startup ({status}):\n{log_tail}")]
    EarlyExit { status: String, log_tail: String },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("screenshot failed: {0}")]
    Screenshot(String),

    #[error("screenshot timed out after {0}s, try increasing the screenshot delay")]
    ScreenshotTimeout(u64),

    #[error("screen detection error: {0}")]
    Screens(String),

    #[error("ipc error: {0}")]
    Ipc(String),
}

pub type Result<T> = std::result::Result<T, VitrineError>;
