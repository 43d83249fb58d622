use std::time::Duration;

use ksni::blocking::TrayMethods;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

use vitrine_core::ipc::{self, IpcRequest, IpcResponse};

/// The daemon drops the tray from its sampler whenever the engine stops, so
/// registration is repeated. Re-registering the same pid keeps its history.
const REGISTER_INTERVAL: Duration = Duration::from_secs(5);

struct VitrineTray {
    rt: Handle,
}

impl VitrineTray {
    /// Send one request to the daemon from the tray's menu thread.
    fn send(&self, request: IpcRequest) {
        match self.rt.block_on(ipc::send_request(&request)) {
            Ok(IpcResponse::Ok { .. }) => info!(?request, "request sent"),
            Ok(IpcResponse::Error { message }) => warn!(?request, "daemon refused: {message}"),
            Err(e) => warn!(?request, "daemon unreachable: {e}"),
        }
    }
}

impl ksni::Tray for VitrineTray {
    fn id(&self) -> String {
        "vitrine".into()
    }

    fn icon_name(&self) -> String {
        "preferences-desktop-wallpaper".into()
    }

    fn title(&self) -> String {
        "Vitrine".into()
    }

    fn tool_tip(&self) -> ksni::ToolTip {
        ksni::ToolTip {
            title: "Vitrine - Wallpaper Engine".into(),
            ..Default::default()
        }
    }

    fn menu(&self) -> Vec<ksni::MenuItem<Self>> {
        use ksni::menu::*;

        vec![
            StandardItem {
                label: "Restart".into(),
                activate: Box::new(|tray: &mut Self| tray.send(IpcRequest::Restart)),
                ..Default::default()
            }
            .into(),
            StandardItem {
                label: "Stop".into(),
                activate: Box::new(|tray: &mut Self| tray.send(IpcRequest::Stop)),
                ..Default::default()
            }
            .into(),
            MenuItem::Separator,
            StandardItem {
                label: "Quit daemon".into(),
                activate: Box::new(|tray: &mut Self| {
                    tray.send(IpcRequest::Quit);
                    info!("daemon asked to quit, closing tray");
                    std::process::exit(0);
                }),
                ..Default::default()
            }
            .into(),
        ]
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vitrine_tray=info".into()),
        )
        .init();

    let rt = Runtime::new()?;

    let tray = VitrineTray {
        rt: rt.handle().clone(),
    };
    let _handle = tray.spawn()?;
    info!("tray spawned");

    // so the daemon samples the tray alongside itself and the engine
    let register = IpcRequest::RegisterTray {
        pid: std::process::id(),
    };
    let mut registered = false;
    loop {
        match rt.block_on(ipc::send_request(&register)) {
            Ok(_) if !registered => {
                info!("registered with daemon");
                registered = true;
            }
            Ok(_) => {}
            Err(e) if registered => {
                debug!("daemon unreachable: {e}");
                registered = false;
            }
            Err(e) => debug!("could not register with daemon: {e}"),
        }
        std::thread::sleep(REGISTER_INTERVAL);
    }
}
