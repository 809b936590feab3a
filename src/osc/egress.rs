//! Best-effort `/beat` unicast.
//!
//! Publish failures must not slow the pipelines or spam the logs: each
//! failure is counted, but warned at most once per sensor per minute;
//! in between they land at debug level.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::analysis::BeatEvent;
use crate::error::TransportError;
use crate::osc::beat_message;
use crate::pipeline::WallClock;
use crate::tunables::SENSOR_SLOTS;

pub struct BeatEgress {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    clock: WallClock,
    /// Last minute (since boot) a send failure was warned, per sensor;
    /// 0 means never.
    warned_minute: [u64; SENSOR_SLOTS],
}

impl BeatEgress {
    pub async fn bind(targets: Vec<SocketAddr>, clock: WallClock) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|source| TransportError::Bind {
                addr: "0.0.0.0:0".to_string(),
                source,
            })?;
        info!(?targets, "egress ready");
        Ok(Self {
            socket,
            targets,
            clock,
            warned_minute: [0; SENSOR_SLOTS],
        })
    }

    /// Forward every broadcast beat to all targets until the channel closes.
    pub async fn run(mut self, mut beat_rx: broadcast::Receiver<BeatEvent>) {
        loop {
            match beat_rx.recv().await {
                Ok(beat) => self.publish(&beat).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "egress lagged behind the beat stream");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn publish(&mut self, beat: &BeatEvent) {
        let packet = beat_message(beat);
        let bytes = match rosc::encoder::encode(&packet) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(?err, "failed to encode beat message");
                return;
            }
        };
        for target in &self.targets {
            if let Err(source) = self.socket.send_to(&bytes, target).await {
                let err = TransportError::Send {
                    target: target.to_string(),
                    source,
                };
                let minute = self.clock.now_ms() / 60_000 + 1;
                let slot = beat.ppg_id as usize % SENSOR_SLOTS;
                if self.warned_minute[slot] != minute {
                    self.warned_minute[slot] = minute;
                    warn!(ppg_id = beat.ppg_id, %err, "beat publish failed");
                } else {
                    debug!(ppg_id = beat.ppg_id, %err, "beat publish failed");
                }
            }
        }
    }
}
