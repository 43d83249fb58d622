use tokio::process::Command;
use tracing::debug;

/// Best-effort desktop notification via `notify-send`. Failures are logged
/// and otherwise ignored.
pub async fn desktop(summary: &str, body: &str) {
    let result = Command::new("notify-send")
        .args(["--app-name", "vitrine", "--urgency", "critical", summary, body])
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => {}
        Ok(output) => debug!(
            "notify-send failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => debug!("notify-send unavailable: {e}"),
    }
}
