//! Chersonesos onboard camera pipeline

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chersonesos::capture::{CameraBackend, SimulatedBackend, SimulatedDevice};
use chersonesos::overlay::telemetry::TelemetryLink;
use chersonesos::utils::{BackgroundPool, StopFlag};
use chersonesos::{CameraOrchestrator, Config, PipelineEvent};
use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Host loop poll interval
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "chersonesos")]
#[command(version, about = "ROV multi-camera capture, streaming and recording", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use simulated cameras named after the configured cameras
    #[arg(long)]
    simulate: bool,

    /// Start recording every camera once the cameras are up
    #[arg(short, long)]
    record: bool,

    /// Start streaming every camera once the cameras are up
    #[arg(short, long)]
    stream: bool,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "chersonesos=info",
        1 => "chersonesos=debug",
        _ => "chersonesos=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Chersonesos v{} launching", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load(args.config.as_deref()).wrap_err("loading configuration")?);
    let backend = select_backend(&args, &config)?;
    let mut orchestrator = CameraOrchestrator::new(config.clone(), backend, BackgroundPool::new(tokio::runtime::Handle::current()));

    let _telemetry = if config.telemetry.enabled {
        match TelemetryLink::bind(&config.telemetry, orchestrator.hud_inputs().telemetry.clone()) {
            Ok(link) => Some(link),
            Err(e) => {
                warn!(bind = %config.telemetry.bind, error = %e, "Telemetry link unavailable, HUD shows defaults");
                None
            }
        }
    } else {
        None
    };

    let stop = StopFlag::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            ctrl_c.set();
        }
    });

    let host = tokio::task::spawn_blocking(move || run(&mut orchestrator, &args, &stop));
    host.await.map_err(|e| eyre!("host loop panicked: {e}"))?
}

fn select_backend(args: &Args, config: &Config) -> Result<Arc<dyn CameraBackend>> {
    if !args.simulate {
        #[cfg(feature = "v4l2")]
        {
            info!("Using V4L2 cameras");
            return Ok(Arc::new(chersonesos::capture::V4l2Backend::new()));
        }
        #[cfg(not(feature = "v4l2"))]
        return Err(eyre!("built without the v4l2 feature, pass --simulate to run on simulated cameras"));
    }

    info!(cameras = ?config.cameras.names, "Using simulated cameras");
    Ok(Arc::new(SimulatedBackend::new(
        config.cameras.names.iter().map(SimulatedDevice::new).collect(),
    )))
}

/// Drive the orchestrator until interrupted or a fatal failure
fn run(orchestrator: &mut CameraOrchestrator, args: &Args, stop: &StopFlag) -> Result<()> {
    orchestrator.check_cameras();

    while !stop.is_set() {
        for event in orchestrator.poll(POLL_INTERVAL) {
            match &event {
                PipelineEvent::FrameReady { camera, sequence } => debug!(%camera, sequence, "Heartbeat"),
                PipelineEvent::ReconnectComplete => {
                    info!(cameras = ?orchestrator.camera_names(), "Pipeline ready");
                    start_requested(orchestrator, args);
                }
                PipelineEvent::Shutdown { reason } => {
                    error!(%reason, "Pipeline shut down");
                    orchestrator.stop_all();
                    return Err(eyre!("fatal pipeline failure: {reason}"));
                }
                PipelineEvent::Warning { .. } | PipelineEvent::Error { .. } => {}
                other => info!(event = ?other, "Pipeline event"),
            }
        }
    }

    info!("Stopping cameras");
    orchestrator.stop_all();
    Ok(())
}

fn start_requested(orchestrator: &mut CameraOrchestrator, args: &Args) {
    let recording = orchestrator.config().recording.clone();
    for camera in orchestrator.camera_names() {
        if args.stream {
            if let Err(e) = orchestrator.start_streaming(&camera) {
                warn!(%camera, error = %e, "Streaming not started");
            }
        }
        if args.record {
            if let Err(e) = orchestrator.start_recording(&camera, recording.interval_secs, recording.stored_files_limit) {
                warn!(%camera, error = %e, "Recording not started");
            }
        }
    }
}
