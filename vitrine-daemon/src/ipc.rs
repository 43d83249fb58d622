use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use vitrine_core::config::SettingsStore;
use vitrine_core::history::{PlaybackHistory, ScreenshotHistory};
use vitrine_core::ipc::{IpcRequest, IpcResponse};
use vitrine_core::paths::VitrinePaths;
use vitrine_core::screens::ScreenEnumerator;

use crate::controller::{DaemonCommand, Reply};
use crate::sampler::state::ChannelSubscriber;
use crate::sampler::SamplerHandle;

/// Snapshots buffered per watcher before it counts as stalled.
const WATCH_BUFFER: usize = 8;

/// Everything a connection handler may touch. Reads are served directly;
/// anything that changes engine state goes through the controller.
#[derive(Clone)]
pub struct IpcContext {
    pub cmd_tx: mpsc::Sender<DaemonCommand>,
    pub sampler: SamplerHandle,
    pub settings: Arc<SettingsStore>,
    pub screens: Arc<dyn ScreenEnumerator>,
    pub paths: VitrinePaths,
}

pub async fn serve_ipc(
    socket_path: PathBuf,
    ctx: IpcContext,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // clean up stale socket
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "IPC socket listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, ctx).await {
                                warn!("IPC connection error: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("IPC accept error: {e}"),
                }
            }
            _ = shutdown.changed() => {
                info!("IPC server shutting down");
                let _ = std::fs::remove_file(&socket_path);
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, ctx: IpcContext) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    buf_reader.read_line(&mut line).await?;

    let request: IpcRequest = match serde_json::from_str(line.trim()) {
        Ok(r) => r,
        Err(e) => {
            let resp = IpcResponse::error(format!("invalid request: {e}"));
            write_line(&mut writer, &resp).await?;
            return Ok(());
        }
    };

    if let IpcRequest::Watch = request {
        return stream_snapshots(writer, &ctx).await;
    }

    let response = dispatch_request(request, &ctx).await;
    write_line(&mut writer, &response).await
}

async fn write_line<T: serde::Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Forward every sampler snapshot until the client goes away. Dropping the
/// receiver makes the subscriber report closed, and the sampler removes it.
async fn stream_snapshots(mut writer: OwnedWriteHalf, ctx: &IpcContext) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(WATCH_BUFFER);
    ctx.sampler.subscribe("ipc-watch", Box::new(ChannelSubscriber(tx)));
    debug!("watch client connected");

    while let Some(snapshot) = rx.recv().await {
        if let Err(e) = write_line(&mut writer, &snapshot).await {
            debug!("watch client gone: {e}");
            break;
        }
    }
    Ok(())
}

/// Send a command carrying a reply channel and wait for the answer.
async fn ask<T: serde::Serialize>(
    cmd_tx: &mpsc::Sender<DaemonCommand>,
    build: impl FnOnce(Reply<T>) -> DaemonCommand,
) -> IpcResponse {
    let (tx, rx) = oneshot::channel();
    if cmd_tx.send(build(tx)).await.is_err() {
        return IpcResponse::error("controller unavailable");
    }
    match rx.await {
        Ok(Ok(value)) => to_data(&value),
        Ok(Err(msg)) => IpcResponse::error(msg),
        Err(_) => IpcResponse::error("controller dropped response"),
    }
}

fn to_data<T: serde::Serialize>(value: &T) -> IpcResponse {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Null) => IpcResponse::ok(),
        Ok(data) => IpcResponse::ok_with_data(data),
        Err(e) => IpcResponse::error(format!("failed to encode response: {e}")),
    }
}

fn from_result<T: serde::Serialize>(result: vitrine_core::error::Result<T>) -> IpcResponse {
    match result {
        Ok(value) => to_data(&value),
        Err(e) => IpcResponse::error(e.to_string()),
    }
}

async fn dispatch_request(request: IpcRequest, ctx: &IpcContext) -> IpcResponse {
    let cmd_tx = &ctx.cmd_tx;
    match request {
        IpcRequest::Status => {
            let (tx, rx) = oneshot::channel();
            if cmd_tx.send(DaemonCommand::Status { respond: tx }).await.is_err() {
                return IpcResponse::error("controller unavailable");
            }
            match rx.await {
                Ok(status) => to_data(&status),
                Err(_) => IpcResponse::error("controller dropped response"),
            }
        }
        IpcRequest::Apply {
            wallpaper,
            screen,
            screens,
        } => {
            ask(cmd_tx, |respond| DaemonCommand::Apply {
                wallpaper,
                screen,
                screens,
                respond,
            })
            .await
        }
        IpcRequest::StopScreen { screen } => {
            ask(cmd_tx, |respond| DaemonCommand::StopScreen { screen, respond }).await
        }
        IpcRequest::Stop => ask(cmd_tx, |respond| DaemonCommand::Stop { respond }).await,
        IpcRequest::Restart => ask(cmd_tx, |respond| DaemonCommand::Restart { respond }).await,
        IpcRequest::Screenshot { wallpaper, output } => {
            ask(cmd_tx, |respond| DaemonCommand::Screenshot {
                wallpaper,
                output: output.map(PathBuf::from),
                respond,
            })
            .await
        }
        IpcRequest::Stats => match ctx.sampler.latest().await {
            Some(snapshot) => to_data(&snapshot),
            None => IpcResponse::error("no samples yet"),
        },
        // handled before dispatch
        IpcRequest::Watch => IpcResponse::error("watch must be the only request on a connection"),
        IpcRequest::Screens { refresh } => to_data(&ctx.screens.screens(refresh).await),
        IpcRequest::GetSetting { key } => from_result(ctx.settings.get(&key)),
        IpcRequest::SetSetting { key, value } => {
            ask(cmd_tx, |respond| DaemonCommand::SetSetting { key, value, respond }).await
        }
        IpcRequest::SetProperty {
            wallpaper,
            name,
            value,
        } => {
            ask(cmd_tx, |respond| DaemonCommand::SetProperty {
                wallpaper,
                name,
                value,
                respond,
            })
            .await
        }
        IpcRequest::ClearProperties { wallpaper } => {
            ask(cmd_tx, |respond| DaemonCommand::ClearProperties { wallpaper, respond }).await
        }
        IpcRequest::History => to_data(&playback_history(ctx).load()),
        IpcRequest::ClearHistory => from_result(playback_history(ctx).clear()),
        IpcRequest::ScreenshotHistory => to_data(&screenshot_history(ctx).load()),
        IpcRequest::ClearScreenshotHistory => from_result(screenshot_history(ctx).clear()),
        IpcRequest::RegisterTray { pid } => {
            let _ = cmd_tx.send(DaemonCommand::RegisterTray { pid }).await;
            IpcResponse::ok()
        }
        IpcRequest::Quit => {
            let _ = cmd_tx.send(DaemonCommand::Quit).await;
            IpcResponse::ok()
        }
    }
}

fn playback_history(ctx: &IpcContext) -> PlaybackHistory {
    PlaybackHistory::playback(ctx.paths.history_file())
}

fn screenshot_history(ctx: &IpcContext) -> ScreenshotHistory {
    ScreenshotHistory::screenshots(ctx.paths.screenshot_history_file())
}
