//! On-disk capture and replay of sample-bundle streams.
//!
//! Captures are one JSON record per line with arrival offsets relative to
//! capture start, so a replay reproduces the original pacing regardless of
//! when it runs. Replayed streams land on the virtual channel block (ids
//! 4-7) by default and run the identical pipeline as live sensors.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::osc::ppg_message;
use crate::pipeline::SampleBundle;
use crate::tunables::{BUNDLE_SAMPLES, VIRTUAL_ID_BASE};

/// An inbound bundle paired with its wall arrival stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedBundle {
    pub bundle: SampleBundle,
    pub arrival_ms: u64,
}

/// One capture file line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub offset_ms: u64,
    pub ppg_id: u8,
    pub samples: [i32; BUNDLE_SAMPLES],
    pub device_ms: i64,
}

/// Recorder task: append every broadcast bundle until the channel closes.
/// I/O failures end the recording but never the daemon.
pub async fn run_recorder(path: PathBuf, mut bundle_rx: broadcast::Receiver<TimedBundle>) {
    let file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            error!(path = %path.display(), %err, "failed to create capture file");
            return;
        }
    };
    let mut writer = tokio::io::BufWriter::new(file);
    let mut start_ms: Option<u64> = None;
    info!(path = %path.display(), "recording inbound bundles");

    loop {
        match bundle_rx.recv().await {
            Ok(timed) => {
                let start = *start_ms.get_or_insert(timed.arrival_ms);
                let record = CaptureRecord {
                    offset_ms: timed.arrival_ms.saturating_sub(start),
                    ppg_id: timed.bundle.ppg_id,
                    samples: timed.bundle.samples,
                    device_ms: timed.bundle.device_ms,
                };
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(%err, "failed to serialize capture record");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(err) = writer.write_all(&line).await {
                    warn!(path = %path.display(), %err, "capture write failed; recording stopped");
                    return;
                }
                if let Err(err) = writer.flush().await {
                    warn!(path = %path.display(), %err, "capture flush failed; recording stopped");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "recorder lagged; bundles dropped from capture");
            }
            Err(broadcast::error::RecvError::Closed) => {
                let _ = writer.flush().await;
                info!(path = %path.display(), "recording finished");
                return;
            }
        }
    }
}

/// Read a whole capture file into memory.
pub fn read_capture(path: &Path) -> Result<Vec<CaptureRecord>> {
    use std::io::BufRead;

    let file = std::fs::File::open(path)
        .with_context(|| format!("opening capture {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading capture line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("parsing capture line {}", idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Re-send a capture as paced `/ppg/{id}` packets to a running daemon.
pub async fn run_replay(path: &Path, target: SocketAddr, raw_ids: bool) -> Result<()> {
    let records = read_capture(path)?;
    if records.is_empty() {
        info!(path = %path.display(), "capture is empty; nothing to replay");
        return Ok(());
    }

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("binding replay socket")?;
    let start = tokio::time::Instant::now();
    info!(count = records.len(), %target, "replaying capture");

    for record in records {
        tokio::time::sleep_until(start + Duration::from_millis(record.offset_ms)).await;
        let ppg_id = if raw_ids {
            record.ppg_id
        } else {
            remap_virtual(record.ppg_id)
        };
        let packet = ppg_message(ppg_id, &record.samples, record.device_ms);
        let bytes = rosc::encoder::encode(&packet)
            .map_err(|err| anyhow::anyhow!("encoding replay packet: {:?}", err))?;
        socket
            .send_to(&bytes, target)
            .await
            .context("sending replay packet")?;
    }
    info!("replay finished");
    Ok(())
}

/// Physical ids replay onto the virtual channel block so a replay can run
/// next to live sensors; ids already in the virtual block pass through.
pub fn remap_virtual(ppg_id: u8) -> u8 {
    if ppg_id < VIRTUAL_ID_BASE {
        ppg_id + VIRTUAL_ID_BASE
    } else {
        ppg_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_roundtrip() {
        let record = CaptureRecord {
            offset_ms: 1_250,
            ppg_id: 2,
            samples: [100, 200, 300, 400, 500],
            device_ms: 98_765,
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: CaptureRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_remap_virtual() {
        assert_eq!(remap_virtual(0), 4);
        assert_eq!(remap_virtual(3), 7);
        assert_eq!(remap_virtual(4), 4, "virtual ids pass through");
        assert_eq!(remap_virtual(7), 7);
    }
}
