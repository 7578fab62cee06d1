//! # mixd
//!
//! Low-latency mmap audio mixing daemon.
//!
//! Without real drivers the daemon runs over mock devices: one synthetic
//! client plays a tone into the speaker endpoint and another records from the
//! microphone endpoint, then the service state is dumped.

mod client;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mixd_audio::mock::{MockDeviceConfig, MockDeviceFactory};
use mixd_audio::{AudioService, DeviceFactory, InMemoryStreamManager, StreamManager};
use mixd_core::{
    DeviceInfo, DeviceRole, DeviceType, EngineConfig, ProcessConfig, SampleFormat, StreamInfo,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mixd")]
#[command(about = "Low-latency mmap audio mixing daemon", long_about = None)]
struct Args {
    /// Engine config (JSON). Defaults to the user config dir.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long the synthetic clients run
    #[arg(short, long, default_value_t = 2)]
    duration_secs: u64,

    /// Sample rate of the mock devices
    #[arg(long, default_value_t = 48000)]
    rate: u32,

    /// Frames per device span
    #[arg(long, default_value_t = 960)]
    span_frames: u32,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "mixd").map(|dirs| dirs.config_dir().join("config.json"))
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    if let Some(path) = &args.config {
        return EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            info!("Using config {}", path.display());
            EngineConfig::load(&path).with_context(|| format!("loading config {}", path.display()))
        }
        _ => Ok(EngineConfig::default()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "mixd=debug,mixd_audio=debug"
    } else {
        "mixd=info,mixd_audio=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    info!("Starting mixd v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let info = StreamInfo::new(args.rate, 2, SampleFormat::S16Le);
    info.validate()?;

    let factory = Arc::new(MockDeviceFactory::new(MockDeviceConfig {
        span_frames: args.span_frames,
        span_count: 4,
    }));
    let manager = Arc::new(InMemoryStreamManager::new());
    let service = AudioService::with_stream_manager(
        config,
        Arc::clone(&factory) as Arc<dyn DeviceFactory>,
        manager as Arc<dyn StreamManager>,
    );
    service.register_device(DeviceInfo::local(
        0,
        DeviceType::Speaker,
        DeviceRole::Output,
        "spk0",
        info,
    ))?;
    service.register_device(DeviceInfo::local(
        1,
        DeviceType::Microphone,
        DeviceRole::Input,
        "mic0",
        info,
    ))?;

    let player = service.acquire_stream(&ProcessConfig::playback(info))?;
    let recorder = service.acquire_stream(&ProcessConfig::capture(info))?;
    if let Some(mic) = factory.device("mic0") {
        mic.set_capture_tone(220.0, 0.3);
    }
    let notifier = service.create_normal_stream(&ProcessConfig::playback(info))?;

    let clients = client::SyntheticClients::spawn(&player, &recorder, info)?;
    std::thread::sleep(Duration::from_secs(args.duration_secs));
    let report = clients.finish();

    println!("{}", service.dump());
    info!(
        "Played {} spans ({} underruns), recorded {} spans ({} with signal)",
        report.played, report.underruns, report.recorded, report.recorded_non_silent
    );
    if let Some(spk) = factory.device("spk0") {
        info!(
            "spk0 rendered {} spans, {} non-silent",
            spk.rendered_spans(),
            spk.non_silent_spans()
        );
    }

    service.release_normal_stream(&notifier)?;
    for stream in [&player, &recorder] {
        if let Err(e) = stream.stop() {
            warn!("Stream {} stop: {e}", stream.session_id());
        }
        stream.release()?;
    }
    service.shutdown();
    info!("mixd stopped");
    Ok(())
}
