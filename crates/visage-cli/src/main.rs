use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

mod setup;

#[derive(Parser)]
#[command(name = "accessctl", about = "accessd model setup and operator probe")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and verify the ONNX models accessd needs.
    Setup {
        /// Destination directory (defaults to the platform model directory).
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Connect to a running accessd as an operator and print an RTT probe
    /// plus the currently connected device list.
    Status {
        /// WebSocket URL of the daemon's `/ws` endpoint.
        #[arg(long, default_value = "ws://127.0.0.1:7878/ws")]
        url: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Setup { model_dir } => setup::run(model_dir),
        Command::Status { url } => {
            let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
            rt.block_on(run_status(&url))
        }
    }
}

async fn run_status(url: &str) -> Result<()> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    socket
        .send(Message::Text(
            serde_json::json!({"cmd": "admin_hello"}).to_string().into(),
        ))
        .await?;

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let started = std::time::Instant::now();
    socket
        .send(Message::Text(
            serde_json::json!({"cmd": "admin_ping", "ts": ts}).to_string().into(),
        ))
        .await?;
    socket
        .send(Message::Text(
            serde_json::json!({"cmd": "admin_list_devices"}).to_string().into(),
        ))
        .await?;

    let mut saw_pong = false;
    let mut saw_devices = false;
    while !(saw_pong && saw_devices) {
        let Some(Ok(msg)) = socket.next().await else {
            break;
        };
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        match frame.get("ret").and_then(|v| v.as_str()) {
            Some("admin_ping") => {
                println!("admin_ping RTT: {:?}", started.elapsed());
                saw_pong = true;
            }
            Some("admin_list_devices") => {
                let devices = frame
                    .get("devices")
                    .cloned()
                    .unwrap_or(serde_json::Value::Array(vec![]));
                println!("connected devices: {devices}");
                saw_devices = true;
            }
            _ => {}
        }
    }

    Ok(())
}
