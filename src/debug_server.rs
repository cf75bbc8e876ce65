//! TCP debug server for inspecting the daemon without BLE hardware nearby.
//!
//! Listens on a TCP port and accepts line-based text commands. Read-only:
//! it renders the status snapshot the manager publishes, and cannot touch
//! core state.
//!
//! Usage from a dev machine:
//!   nc host 8828
//!
//! Commands:
//!   state   show per-device lifecycle state and last readings
//!   sub     subscribe to a 1 Hz status stream
//!   help    list commands
//!   quit    disconnect

use std::sync::Arc;

use log::info;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::manager::StatusSnapshot;

/// Run the TCP debug server.
pub async fn run(
    status: Arc<Mutex<StatusSnapshot>>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Debug server listening on port {}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Debug client connected from {}", addr);

        let status = status.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, status).await {
                info!("Debug client {} disconnected: {}", addr, e);
            }
        });
    }
}

async fn handle_client(
    stream: tokio::net::TcpStream,
    status: Arc<Mutex<StatusSnapshot>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"hrfeed-debug> connected. type 'help' for commands.\n")
        .await?;

    loop {
        writer.write_all(b"hrfeed-debug> ").await?;

        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim().to_lowercase();
                if line.is_empty() {
                    continue;
                }

                match line.as_str() {
                    "help" => {
                        writer.write_all(HELP_TEXT.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                    }
                    "state" => {
                        let out = render_state(&status).await;
                        writer.write_all(out.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                    }
                    "sub" => handle_subscribe(&status, &mut writer).await?,
                    "quit" | "exit" => return Ok(()),
                    _ => {
                        let msg = format!("unknown command: '{}'. type 'help'.\n", line);
                        writer.write_all(msg.as_bytes()).await?;
                    }
                }
            }
            None => return Ok(()),
        }
    }
}

async fn render_state(status: &Arc<Mutex<StatusSnapshot>>) -> String {
    let s = status.lock().await.clone();

    let mut out = format!(
        "radio:     {}\n\
         scanning:  {}\n\
         pending:   {} reconnect(s)\n\
         blocked:   {} device(s)",
        if s.radio_ready { "ready" } else { "unavailable" },
        s.scanning,
        s.pending_reconnects,
        s.blocked,
    );

    if s.devices.is_empty() {
        out.push_str("\ndevices:   none seen yet");
    } else {
        out.push_str("\ndevices:");
        for d in &s.devices {
            let bpm = match d.bpm {
                Some(bpm) => format!("{} bpm", bpm),
                None => "-".to_string(),
            };
            out.push_str(&format!(
                "\n  {} - {} [{}] {}",
                d.id, d.label, d.state, bpm
            ));
        }
    }

    out
}

async fn handle_subscribe(
    status: &Arc<Mutex<StatusSnapshot>>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    writer
        .write_all(b"subscribed to status at 1 Hz. ctrl-c to stop.\n")
        .await?;

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        interval.tick().await;

        let s = status.lock().await.clone();
        let subscribed: Vec<String> = s
            .devices
            .iter()
            .filter(|d| d.state == "subscribed")
            .map(|d| {
                let bpm = d
                    .bpm
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "--".to_string());
                format!("hr {} bpm | {} ({})\n", bpm, d.label, d.id)
            })
            .collect();

        let chunk = if subscribed.is_empty() {
            format!("hr -- bpm | no subscribed devices (scanning: {})\n", s.scanning)
        } else {
            subscribed.concat()
        };

        if writer.write_all(chunk.as_bytes()).await.is_err() {
            break;
        }
    }

    Ok(())
}

const HELP_TEXT: &str = "\
commands:
  state   show per-device lifecycle state and last readings
  sub     subscribe to 1 Hz status stream
  help    this message
  quit    disconnect";
