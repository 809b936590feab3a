use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pulsebeat::capture;
use pulsebeat::config::AppConfig;
use pulsebeat::engine::Engine;
use pulsebeat::osc::ppg_message;
use pulsebeat::testing::signals::{bundles_from_samples, pulse_wave};

#[derive(Parser, Debug)]
#[command(
    name = "pulsebeat",
    about = "PPG signal-to-beat engine: OSC sample ingress, per-sensor rhythm pipelines, beat egress"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon: /ppg ingress, pipelines, /beat egress
    Serve {
        /// YAML config file; defaults apply when omitted or unreadable
        #[arg(long)]
        config: Option<PathBuf>,
        /// Record accepted inbound bundles to this JSONL file
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Re-send a recorded capture as paced /ppg bundles
    Replay {
        #[arg(long)]
        file: PathBuf,
        /// Running daemon's ingress address
        #[arg(long, default_value = "127.0.0.1:9000")]
        target: String,
        /// Keep the recorded sensor ids instead of remapping onto the
        /// virtual channel block
        #[arg(long)]
        raw_ids: bool,
    },
    /// Stream a synthetic pulse waveform for end-to-end smoke tests
    Synth {
        #[arg(long, default_value_t = 60.0)]
        bpm: f64,
        #[arg(long, default_value = "127.0.0.1:9000")]
        target: String,
        /// Sensor id to publish on
        #[arg(long, default_value_t = 0)]
        id: u8,
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, record } => run_serve(config, record).await,
        Commands::Replay {
            file,
            target,
            raw_ids,
        } => {
            let target = parse_target(&target)?;
            capture::run_replay(&file, target, raw_ids).await
        }
        Commands::Synth {
            bpm,
            target,
            id,
            seconds,
        } => {
            let target = parse_target(&target)?;
            run_synth(bpm, target, id, seconds).await
        }
    }
}

fn parse_target(target: &str) -> Result<SocketAddr> {
    target
        .parse()
        .with_context(|| format!("parsing target address {:?}", target))
}

async fn run_serve(config_path: Option<PathBuf>, record: Option<PathBuf>) -> Result<()> {
    let mut config = config_path
        .map(AppConfig::load_from_file)
        .unwrap_or_default();
    if record.is_some() {
        config.capture.record_path = record;
    }

    let engine = Engine::start(&config).await?;
    info!(ingress = %engine.ingress_addr(), "pulsebeat serving");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    Ok(())
}

async fn run_synth(bpm: f64, target: SocketAddr, id: u8, seconds: u64) -> Result<()> {
    let samples = pulse_wave(bpm, seconds * 1_000);
    let bundles = bundles_from_samples(id, &samples, 0);
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
        .await
        .context("binding synth socket")?;

    info!(bpm, %target, id, seconds, "streaming synthetic pulse");
    let start = tokio::time::Instant::now();
    for (k, bundle) in bundles.iter().enumerate() {
        tokio::time::sleep_until(start + Duration::from_millis(k as u64 * 100)).await;
        let packet = ppg_message(bundle.ppg_id, &bundle.samples, bundle.device_ms);
        let bytes = rosc::encoder::encode(&packet)
            .map_err(|err| anyhow::anyhow!("encoding synth packet: {:?}", err))?;
        socket
            .send_to(&bytes, target)
            .await
            .context("sending synth packet")?;
    }
    info!("synthetic stream finished");
    Ok(())
}
