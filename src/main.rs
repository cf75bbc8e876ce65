use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use hrfeed::config::{self, Settings, DEFAULT_DEBUG_PORT};
use hrfeed::manager::{Manager, StatusSnapshot};
use hrfeed::{ble, debug_server, manager, sink};

#[tokio::main]
async fn main() {
    env_logger::init();

    let settings = parse_args();
    log::info!(
        "HR feed daemon starting, output: {}, max devices: {}, debug port: {}",
        settings
            .output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string()),
        settings
            .max_devices
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unbounded".to_string()),
        settings.debug_port,
    );

    let status = Arc::new(Mutex::new(StatusSnapshot::default()));

    // Transport events flow driver -> manager; requests flow back through
    // the BleTransport handle; decoded samples flow manager -> sink.
    let (event_tx, event_rx) = mpsc::channel(64);
    let (sample_tx, sample_rx) = mpsc::unbounded_channel();
    let (transport, request_rx) = ble::transport();

    let mgr = Manager::new(transport, &settings, sample_tx);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received shutdown signal");
        }
        result = ble::run(request_rx, event_tx) => {
            if let Err(e) = result {
                log::error!("BLE driver exited with error: {}", e);
            }
        }
        result = manager::run(mgr, event_rx, status.clone()) => {
            if let Err(e) = result {
                log::error!("Manager task exited with error: {}", e);
            }
        }
        result = sink::run(sample_rx, settings.output.clone(), settings.truncate) => {
            if let Err(e) = result {
                log::error!("Sink task exited with error: {}", e);
            }
        }
        result = debug_server::run(status.clone(), settings.debug_port), if settings.debug_port != 0 => {
            if let Err(e) = result {
                log::error!("Debug server exited with error: {}", e);
            }
        }
    }

    log::info!("HR feed daemon shutting down");
}

fn parse_args() -> Settings {
    let args: Vec<String> = std::env::args().collect();
    let mut settings = Settings::default();
    let mut sources_file: Option<String> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--file" => {
                if let Some(path) = args.get(i + 1) {
                    settings.output = Some(PathBuf::from(path));
                    i += 1;
                }
            }
            "--truncate" => {
                settings.truncate = true;
            }
            "--name" => {
                if let Some(name) = args.get(i + 1) {
                    settings.name_filters.push(name.clone());
                    i += 1;
                }
            }
            "--id" => {
                if let Some(id) = args.get(i + 1) {
                    settings.id_filters.push(id.clone());
                    i += 1;
                }
            }
            "--max-devices" => {
                if let Some(n) = args.get(i + 1) {
                    settings.max_devices = n.parse().ok();
                    i += 1;
                }
            }
            "--scan-all" => {
                settings.scan_all = true;
            }
            "--sources-file" => {
                if let Some(path) = args.get(i + 1) {
                    sources_file = Some(path.clone());
                    i += 1;
                }
            }
            "--preferred-grace" => {
                if let Some(secs) = args.get(i + 1) {
                    settings.preferred_grace = parse_secs(secs, settings.preferred_grace);
                    i += 1;
                }
            }
            "--backoff" => {
                if let Some(secs) = args.get(i + 1) {
                    settings.reconnect_backoff = parse_secs(secs, settings.reconnect_backoff);
                    i += 1;
                }
            }
            "--block-ttl" => {
                if let Some(secs) = args.get(i + 1) {
                    settings.block_ttl = parse_secs(secs, settings.block_ttl);
                    i += 1;
                }
            }
            "--debug-port" => {
                if let Some(port) = args.get(i + 1) {
                    settings.debug_port = port.parse().unwrap_or(DEFAULT_DEBUG_PORT);
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    if let Some(path) = sources_file {
        settings.preferred_names = config::load_sources(&path);
    }

    settings
}

fn parse_secs(value: &str, default: Duration) -> Duration {
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}
