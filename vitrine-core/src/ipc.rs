use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;

use crate::error::{Result, VitrineError};
use crate::models::{PropertyValue, Snapshot};
use crate::paths::VitrinePaths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcRequest {
    Status,
    Apply {
        wallpaper: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screen: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screens: Option<Vec<String>>,
    },
    StopScreen {
        screen: String,
    },
    Stop,
    Restart,
    Screenshot {
        wallpaper: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Stats,
    Watch,
    Screens {
        #[serde(default)]
        refresh: bool,
    },
    GetSetting {
        key: String,
    },
    SetSetting {
        key: String,
        value: serde_json::Value,
    },
    SetProperty {
        wallpaper: String,
        name: String,
        value: PropertyValue,
    },
    ClearProperties {
        wallpaper: String,
    },
    History,
    ClearHistory,
    ScreenshotHistory,
    ClearScreenshotHistory,
    RegisterTray {
        pid: u32,
    },
    Quit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IpcResponse {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
}

impl IpcResponse {
    pub fn ok() -> Self {
        Self::Ok { data: None }
    }

    pub fn ok_with_data(data: serde_json::Value) -> Self {
        Self::Ok { data: Some(data) }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            message: msg.into(),
        }
    }
}

async fn connect(request: &IpcRequest) -> Result<BufReader<OwnedReadHalf>> {
    let socket_path = VitrinePaths::socket_path();
    let stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|e| VitrineError::Ipc(format!("failed to connect to daemon: {e}")))?;

    let (reader, mut writer) = stream.into_split();

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.shutdown().await?;

    Ok(BufReader::new(reader))
}

/// Send a request to the daemon and receive a response.
pub async fn send_request(request: &IpcRequest) -> Result<IpcResponse> {
    let mut reader = connect(request).await?;
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;

    let response: IpcResponse = serde_json::from_str(response_line.trim())?;
    Ok(response)
}

/// Stream sampler snapshots until the daemon closes the connection or
/// `on_snapshot` returns false.
pub async fn watch(mut on_snapshot: impl FnMut(Snapshot) -> bool) -> Result<()> {
    let reader = connect(&IpcRequest::Watch).await?;
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let snapshot: Snapshot = serde_json::from_str(line.trim())?;
        if !on_snapshot(snapshot) {
            break;
        }
    }
    Ok(())
}
