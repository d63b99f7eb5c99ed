use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::protocol::{self, types, Envelope};

#[derive(Parser, Debug)]
#[command(name = "pier-relay")]
#[command(about = "Pier session relay server and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query a running relay over its WebSocket endpoint
    Debug {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Fetch the device list once and print it
    Devices,
    /// Stay connected and print device list broadcasts as they arrive
    Watch,
}

pub async fn run_debug_client(url: String, command: DebugCommands) -> Result<()> {
    let ws_url = format!("{}/ws?role=browser", url.trim_end_matches('/'));
    debug!("connecting to {ws_url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => {
            return Err(anyhow::anyhow!("connection failed: {err}"));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the relay running at {url}?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let request = serde_json::to_string(&protocol::devices_list_request())?;
    write.send(Message::Text(request.into())).await?;

    match command {
        DebugCommands::Devices => {
            let response = timeout(Duration::from_secs(5), async {
                while let Some(frame) = read.next().await {
                    if let Message::Text(text) = frame? {
                        let envelope = serde_json::from_str::<Envelope>(&text)?;
                        if envelope.kind == types::DEVICES_LIST_RESPONSE {
                            return Ok::<Envelope, anyhow::Error>(envelope);
                        }
                    }
                }
                Err(anyhow::anyhow!("connection closed before a device list arrived"))
            })
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for the device list"))??;
            print_device_list(&response);
        }
        DebugCommands::Watch => {
            println!("watching for device list broadcasts (ctrl-c to stop)");
            while let Some(frame) = read.next().await {
                if let Message::Text(text) = frame? {
                    if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                        if envelope.kind == types::DEVICES_LIST_RESPONSE {
                            print_device_list(&envelope);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_device_list(envelope: &Envelope) {
    let devices = envelope
        .payload
        .as_ref()
        .and_then(|payload| payload.get("devices"))
        .and_then(|devices| devices.as_array())
        .cloned()
        .unwrap_or_default();

    if devices.is_empty() {
        println!("no devices registered");
        return;
    }
    for device in devices {
        let field = |name: &str| {
            device
                .get(name)
                .and_then(|value| value.as_str())
                .unwrap_or("-")
                .to_string()
        };
        let capabilities = device
            .get("capabilities")
            .map(|caps| {
                let mut kinds = Vec::new();
                if caps.get("ssh").and_then(|v| v.as_bool()).unwrap_or(false) {
                    kinds.push("ssh");
                }
                if caps.get("rdp").and_then(|v| v.as_bool()).unwrap_or(false) {
                    kinds.push("rdp");
                }
                kinds.join(",")
            })
            .unwrap_or_default();
        println!(
            "{:<20} {:<16} {:<8} {}",
            field("name"),
            field("ipAddress"),
            field("status"),
            capabilities
        );
    }
}
