//! Engine wiring: ingress → per-sensor workers → broadcast fan-out.
//!
//! Each sensor pipeline runs on its own task fed by a bounded channel, so
//! samples, observations, ticks, and emissions for one sensor are strictly
//! serialized while sensors stay independent of each other. Beats fan out
//! on a broadcast channel consumed by the OSC egress, the recorder, and any
//! in-process subscriber.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::analysis::BeatEvent;
use crate::capture::{self, TimedBundle};
use crate::config::AppConfig;
use crate::osc::{BeatEgress, Inbound, OscIngress};
use crate::pipeline::{SampleBundle, SensorPipeline, WallClock};
use crate::tunables::{self, SENSOR_SLOTS, VIRTUAL_ID_BASE};

/// Message to a per-sensor worker task.
enum SensorMsg {
    Bundle(SampleBundle, u64),
    Reset,
}

/// Handle to a running engine. Dropping it does not stop the spawned
/// tasks; the daemon's lifetime is the runtime's lifetime.
pub struct Engine {
    clock: WallClock,
    ingress_addr: SocketAddr,
    beat_tx: broadcast::Sender<BeatEvent>,
    bundle_tx: broadcast::Sender<TimedBundle>,
}

impl Engine {
    /// Validate configuration, bind the sockets, and spawn ingress, the
    /// per-sensor workers, egress, and the optional recorder.
    pub async fn start(config: &AppConfig) -> Result<Engine> {
        // ConfigurationInvalid is fatal at startup only; after this point
        // every condition is recovered inside a single sensor's pipeline.
        tunables::validate().context("tunable validation failed")?;
        let targets = config.resolve_targets()?;

        let ingress = OscIngress::bind(&config.osc.bind_addr).await?;
        let ingress_addr = ingress.local_addr().context("resolving ingress address")?;
        let clock = WallClock::new();
        let (beat_tx, _) = broadcast::channel(256);
        let (bundle_tx, _) = broadcast::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel::<(Inbound, u64)>(256);

        if targets.is_empty() {
            info!("no beat targets configured; egress disabled");
        } else {
            let egress = BeatEgress::bind(targets, clock).await?;
            tokio::spawn(egress.run(beat_tx.subscribe()));
        }

        if let Some(path) = &config.capture.record_path {
            tokio::spawn(capture::run_recorder(path.clone(), bundle_tx.subscribe()));
        }

        tokio::spawn(ingress.run(inbound_tx, clock));
        tokio::spawn(Self::route(
            inbound_rx,
            clock,
            beat_tx.clone(),
            bundle_tx.clone(),
        ));

        Ok(Engine {
            clock,
            ingress_addr,
            beat_tx,
            bundle_tx,
        })
    }

    /// The bound ingress address (useful when binding to port 0).
    pub fn ingress_addr(&self) -> SocketAddr {
        self.ingress_addr
    }

    pub fn clock(&self) -> WallClock {
        self.clock
    }

    /// Subscribe to every emitted beat via an unbounded forwarder, so a
    /// slow in-process consumer can never stall the broadcast.
    pub fn subscribe_beats(&self) -> mpsc::UnboundedReceiver<BeatEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut beat_rx = self.beat_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match beat_rx.recv().await {
                    Ok(beat) => {
                        if tx.send(beat).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// Beats as an async stream.
    pub async fn beat_stream(&self) -> impl Stream<Item = BeatEvent> + Unpin {
        UnboundedReceiverStream::new(self.subscribe_beats())
    }

    /// Subscribe to accepted inbound bundles (recorder, diagnostics).
    pub fn subscribe_bundles(&self) -> broadcast::Receiver<TimedBundle> {
        self.bundle_tx.subscribe()
    }

    /// Router: a fixed-size bank of worker channels keyed by sensor id.
    /// Physical channels come up at start, virtual channels on first
    /// traffic. A backlogged worker drops bundles instead of blocking the
    /// router, so one stuck sensor cannot stall its peers.
    async fn route(
        mut inbound_rx: mpsc::Receiver<(Inbound, u64)>,
        clock: WallClock,
        beat_tx: broadcast::Sender<BeatEvent>,
        bundle_tx: broadcast::Sender<TimedBundle>,
    ) {
        let mut workers: [Option<mpsc::Sender<SensorMsg>>; SENSOR_SLOTS] = Default::default();
        for id in 0..VIRTUAL_ID_BASE {
            workers[id as usize] = Some(Self::spawn_worker(id, clock, beat_tx.clone()));
        }

        while let Some((inbound, arrival_ms)) = inbound_rx.recv().await {
            let id = match &inbound {
                Inbound::Bundle(bundle) => bundle.ppg_id,
                Inbound::Reset(id) => *id,
            } as usize;
            if id >= SENSOR_SLOTS {
                continue;
            }
            let worker = workers[id].get_or_insert_with(|| {
                info!(ppg_id = id, "virtual channel online");
                Self::spawn_worker(id as u8, clock, beat_tx.clone())
            });

            match inbound {
                Inbound::Bundle(bundle) => {
                    let _ = bundle_tx.send(TimedBundle { bundle, arrival_ms });
                    if worker
                        .try_send(SensorMsg::Bundle(bundle, arrival_ms))
                        .is_err()
                    {
                        debug!(ppg_id = id, "worker backlogged; dropping bundle");
                    }
                }
                Inbound::Reset(_) => {
                    let _ = worker.try_send(SensorMsg::Reset);
                }
            }
        }
    }

    fn spawn_worker(
        ppg_id: u8,
        clock: WallClock,
        beat_tx: broadcast::Sender<BeatEvent>,
    ) -> mpsc::Sender<SensorMsg> {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut pipeline = SensorPipeline::new(ppg_id, clock.unix_offset_s());
            while let Some(msg) = rx.recv().await {
                match msg {
                    SensorMsg::Bundle(bundle, arrival_ms) => {
                        for beat in pipeline.handle_bundle(&bundle, arrival_ms) {
                            debug!(
                                ppg_id,
                                bpm = beat.bpm,
                                intensity = beat.intensity,
                                "beat scheduled"
                            );
                            let _ = beat_tx.send(beat);
                        }
                    }
                    SensorMsg::Reset => {
                        info!(ppg_id, "external reset");
                        pipeline.reset();
                    }
                }
            }
        });
        tx
    }
}
