use anyhow::Result;
use clap::{Parser, Subcommand};

use vitrine_core::ipc::{self, IpcRequest, IpcResponse};
use vitrine_core::models::{PropertyValue, Snapshot};

#[derive(Parser)]
#[command(name = "vitrine", about = "Control the vitrine wallpaper engine daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status
    Status,
    /// Show a wallpaper on one or more screens
    Apply {
        /// Wallpaper ID
        id: String,
        /// Target screen; repeat for several. Defaults to the last used screen
        #[arg(long = "screen", short)]
        screens: Vec<String>,
    },
    /// Stop one screen, or everything
    Stop {
        #[arg(long, short)]
        screen: Option<String>,
    },
    /// Restart the engine with the saved assignments
    Restart,
    /// Render a wallpaper to an image file
    Screenshot {
        /// Wallpaper ID (must be active on a screen)
        id: String,
        #[arg(long, short)]
        output: Option<String>,
    },
    /// Show CPU and memory usage
    Stats {
        /// Keep printing every sample
        #[arg(long, short)]
        follow: bool,
    },
    /// List connected screens
    Screens {
        /// Query the display server again instead of using the cache
        #[arg(long)]
        refresh: bool,
    },
    /// Read or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Per-wallpaper property overrides
    Prop {
        #[command(subcommand)]
        action: PropAction,
    },
    /// Playback history
    History {
        #[arg(long)]
        clear: bool,
    },
    /// Screenshot history
    Shots {
        #[arg(long)]
        clear: bool,
    },
    /// Stop the daemon
    Quit,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one setting
    Get { key: String },
    /// Change one setting; the value is JSON, bare words are taken as strings
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum PropAction {
    /// Override one property
    Set {
        wallpaper: String,
        name: String,
        value: String,
    },
    /// Drop all overrides for a wallpaper
    Clear { wallpaper: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Status => IpcRequest::Status,
        Commands::Apply { id, mut screens } => {
            let (screen, screens) = match screens.len() {
                0 => (None, None),
                1 => (screens.pop(), None),
                _ => (None, Some(screens)),
            };
            IpcRequest::Apply {
                wallpaper: id,
                screen,
                screens,
            }
        }
        Commands::Stop { screen: Some(screen) } => IpcRequest::StopScreen { screen },
        Commands::Stop { screen: None } => IpcRequest::Stop,
        Commands::Restart => IpcRequest::Restart,
        Commands::Screenshot { id, output } => IpcRequest::Screenshot {
            wallpaper: id,
            output,
        },
        Commands::Stats { follow: true } => {
            ipc::watch(|snapshot| {
                print_snapshot(&snapshot);
                println!();
                true
            })
            .await
            .map_err(not_running)?;
            return Ok(());
        }
        Commands::Stats { follow: false } => {
            let resp = send(IpcRequest::Stats).await?;
            match resp {
                IpcResponse::Ok { data: Some(data) } => {
                    let snapshot: Snapshot = serde_json::from_value(data)?;
                    print_snapshot(&snapshot);
                }
                other => print_response(other),
            }
            return Ok(());
        }
        Commands::Screens { refresh } => IpcRequest::Screens { refresh },
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => IpcRequest::GetSetting { key },
            ConfigAction::Set { key, value } => IpcRequest::SetSetting {
                key,
                value: parse_value(&value),
            },
        },
        Commands::Prop { action } => match action {
            PropAction::Set {
                wallpaper,
                name,
                value,
            } => IpcRequest::SetProperty {
                wallpaper,
                name,
                value: parse_property(&value),
            },
            PropAction::Clear { wallpaper } => IpcRequest::ClearProperties { wallpaper },
        },
        Commands::History { clear: true } => IpcRequest::ClearHistory,
        Commands::History { clear: false } => IpcRequest::History,
        Commands::Shots { clear: true } => IpcRequest::ClearScreenshotHistory,
        Commands::Shots { clear: false } => IpcRequest::ScreenshotHistory,
        Commands::Quit => IpcRequest::Quit,
    };

    let resp = send(request).await?;
    print_response(resp);
    Ok(())
}

fn not_running(e: impl std::fmt::Display) -> anyhow::Error {
    anyhow::anyhow!("daemon not running. start with: vitrine-daemon\n  ({e})")
}

async fn send(request: IpcRequest) -> Result<IpcResponse> {
    ipc::send_request(&request).await.map_err(not_running)
}

fn print_response(resp: IpcResponse) {
    match resp {
        IpcResponse::Ok { data: Some(data) } => {
            println!(
                "{}",
                serde_json::to_string_pretty(&data).unwrap_or_default()
            );
        }
        IpcResponse::Ok { data: None } => {
            println!("ok");
        }
        IpcResponse::Error { message } => {
            eprintln!("error: {message}");
            std::process::exit(1);
        }
    }
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn parse_property(raw: &str) -> PropertyValue {
    serde_json::from_str(raw).unwrap_or_else(|_| PropertyValue::Text(raw.to_string()))
}

fn print_snapshot(snapshot: &Snapshot) {
    println!("{}", snapshot.timestamp);
    println!(
        "{:<10} {:>8} {:>8} {:>10} {:>8}  name",
        "category", "pid", "cpu %", "mem MB", "threads"
    );
    for (category, sample) in &snapshot.categories {
        println!(
            "{:<10} {:>8} {:>8.1} {:>10.1} {:>8}  {}",
            category.to_string(),
            sample.pid,
            sample.cpu_percent,
            sample.memory_mb,
            sample.threads,
            sample.name
        );
    }
    for (task, sample) in &snapshot.tasks {
        println!(
            "{:<10} {:>8} {:>8.1} {:>10.1} {:>8}  {}",
            task.to_string(),
            sample.pid,
            sample.cpu_percent,
            sample.memory_mb,
            sample.threads,
            sample.name
        );
    }
    let total = &snapshot.total;
    println!(
        "{:<10} {:>8} {:>8.1} {:>10.1} {:>8}",
        "total", "", total.cpu_percent, total.memory_mb, total.threads
    );
}
