use futures_lite::StreamExt;
use hyprland::event_listener::{Event, EventStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::controller::DaemonCommand;

/// Forward Hyprland monitor hotplug events to the controller. Returns when the
/// compositor connection drops or the controller is gone; without Hyprland the
/// daemon simply runs without hotplug handling.
pub async fn listen_monitor_events(cmd_tx: mpsc::Sender<DaemonCommand>) {
    let mut stream = EventStream::new();

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::MonitorAdded(_)) | Ok(Event::MonitorRemoved(_)) => {
                debug!("monitor topology event");
                if cmd_tx.send(DaemonCommand::TopologyChanged).await.is_err() {
                    error!("cmd channel closed, stopping topology listener");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                info!("hyprland events unavailable: {e}");
                break;
            }
        }
    }
}
