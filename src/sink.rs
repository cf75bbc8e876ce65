//! JSONL output sink.
//!
//! Receives decoded heart-rate samples on a channel and appends one JSON
//! object per line to the output file. The file is opened lazily on the
//! first sample so an idle daemon leaves no empty file behind.

use std::path::PathBuf;

use log::{info, warn};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// One decoded heart-rate reading.
#[derive(Debug, Clone, Serialize)]
pub struct HrSample {
    /// Epoch seconds at emission time.
    pub ts: f64,
    pub bpm: u16,
    /// Best-known device label at emission time.
    pub source: String,
    pub id: String,
}

/// Run the sink until the sample channel closes. Without an output path,
/// samples are drained and dropped; the log still carries each reading.
pub async fn run(
    mut samples: mpsc::UnboundedReceiver<HrSample>,
    path: Option<PathBuf>,
    truncate: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(path) = &path {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        if truncate {
            File::create(path).await?;
            info!("Truncated output file {}", path.display());
        }
    }

    let mut out: Option<File> = None;

    while let Some(sample) = samples.recv().await {
        let Some(path) = &path else { continue };

        if out.is_none() {
            match OpenOptions::new().create(true).append(true).open(path).await {
                Ok(file) => {
                    info!("Writing heart-rate stream to {}", path.display());
                    out = Some(file);
                }
                Err(e) => {
                    warn!("Failed to open output file {}: {}", path.display(), e);
                    continue;
                }
            }
        }

        let mut line = serde_json::to_string(&sample)?;
        line.push('\n');
        if let Some(file) = out.as_mut() {
            file.write_all(line.as_bytes()).await?;
        }
    }

    Ok(())
}
