mod controller;
mod ipc;
mod notify;
mod procs;
mod sampler;
mod topology;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;

use vitrine_core::config::SettingsStore;
use vitrine_core::history::PlaybackHistory;
use vitrine_core::models::Category;
use vitrine_core::paths::VitrinePaths;
use vitrine_core::screens::{DisplayScreens, ScreenEnumerator};

use controller::engine::Controller;
use controller::supervisor::Supervisor;
use ipc::IpcContext;
use sampler::probe::SysinfoProbe;
use sampler::SamplerHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vitrine_daemon=info,vitrine_core=info".into()),
        )
        .init();

    let paths = VitrinePaths::new()?;
    paths.ensure_dirs()?;

    let settings = Arc::new(SettingsStore::open(paths.settings_file()));
    let snapshot = settings.snapshot();
    info!(
        engine = %snapshot.wallpaper_engine,
        screens = snapshot.active_monitors.len(),
        "starting vitrine-daemon"
    );

    let sampler = SamplerHandle::new(Box::new(SysinfoProbe::new()));
    sampler.track(Category::Frontend, std::process::id());

    let screens: Arc<dyn ScreenEnumerator> = Arc::new(DisplayScreens::new());
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // spawn monitor hotplug listener
    let topo_tx = cmd_tx.clone();
    tokio::spawn(async move {
        topology::listen_monitor_events(topo_tx).await;
    });

    // spawn IPC server
    let socket = VitrinePaths::socket_path();
    let ctx = IpcContext {
        cmd_tx: cmd_tx.clone(),
        sampler: sampler.clone(),
        settings: settings.clone(),
        screens: screens.clone(),
        paths: paths.clone(),
    };
    let ipc_shutdown = shutdown_rx.clone();
    let ipc_socket = socket.clone();
    tokio::spawn(async move {
        if let Err(e) = ipc::serve_ipc(ipc_socket, ctx, ipc_shutdown).await {
            tracing::error!("IPC server error: {e}");
        }
    });

    // spawn controller
    let supervisor = Supervisor::new(
        settings.clone(),
        screens.clone(),
        sampler.clone(),
        PlaybackHistory::playback(paths.history_file()),
        paths.engine_log(),
    );
    let controller = Controller::new(supervisor, settings, screens, sampler, paths);
    let controller_shutdown = shutdown_rx.clone();
    let mut controller_handle = tokio::spawn(async move {
        controller.run(cmd_rx, controller_shutdown).await;
    });
    drop(cmd_tx);

    // wait for ctrl+c or a quit request
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received ctrl+c, shutting down");
            let _ = shutdown_tx.send(true);
            let _ = (&mut controller_handle).await;
        }
        _ = &mut controller_handle => {
            let _ = shutdown_tx.send(true);
        }
    }

    // clean up socket
    if socket.exists() {
        let _ = std::fs::remove_file(&socket);
    }

    info!("vitrine-daemon stopped");
    Ok(())
}
