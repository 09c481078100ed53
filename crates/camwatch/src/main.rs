//! Service entrypoint: wire the capture fleet, detection, event bus, event
//! orchestrator, and HTTP surface together, then wait for shutdown.

mod bus;
mod config;
mod events;
mod fleet;
mod recorder;
mod server;
mod snapshot;
mod store;
mod telemetry;
mod vision;

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use crate::{
    bus::MqttBus, config::AppConfig, events::EventOrchestrator, fleet::BufferService,
    store::EventStore,
};

#[derive(Parser)]
#[command(name = "camwatch", version, about = "Motion-triggered camera recording service")]
struct CliArgs {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    let config = Arc::new(AppConfig::load(&args.config)?);

    telemetry::init_logging(&config.logging);
    let prometheus = telemetry::init_metrics();
    info!(config = %args.config.display(), "starting camwatch");

    let store = if config.database.enabled {
        match EventStore::open(Path::new(&config.database.path)) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(error = %err, "database unavailable, events will not be persisted");
                None
            }
        }
    } else {
        None
    };

    let bus = Arc::new(MqttBus::new(&config.mqtt).context("creating MQTT client")?);

    let buffers = Arc::new(BufferService::new(Arc::clone(&config)));
    buffers.start_all();
    buffers.load_detection_model();
    if config.detection.continuous {
        buffers.start_detection();
    }

    let orchestrator = EventOrchestrator::new(
        Arc::clone(&buffers),
        bus.clone(),
        store,
        Arc::clone(&config),
    );
    orchestrator.attach(&bus);

    let server = server::spawn_status_server(
        Arc::clone(&buffers),
        bus.clone(),
        prometheus,
        config.api.host.clone(),
        config.api.port,
    )?;
    info!(
        host = %config.api.host,
        port = config.api.port,
        cameras = buffers.camera_ids().len(),
        "service up"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_shutdown.store(true, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    orchestrator.stop();
    buffers.stop_detection();
    buffers.stop_all();
    server.stop();
    bus.shutdown();
    info!("shutdown complete");
    Ok(())
}
