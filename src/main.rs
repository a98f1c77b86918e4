mod aggregator;
mod capture;
mod collector;
mod config;
mod decoder;
mod exporter;
mod flow_table;
mod logging;
mod metrics;
mod staging;

use crate::aggregator::FlowAggregator;
use crate::capture::RawFrame;
use crate::collector::{CollectorClient, DeviceIdentity, HttpCollector};
use crate::config::Config;
use crate::exporter::BatchExporter;
use crate::logging::setup_logging;
use crate::metrics::Metrics;
use crate::staging::StagingArea;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const FRAME_CHANNEL_CAPACITY: usize = 1000;
const EXPORT_CHANNEL_CAPACITY: usize = 256;

fn main() {
    let (config, config_source) = load_config();

    if let Err(e) = setup_logging(&config.logging) {
        eprintln!("Failed to setup logging: {}", e);
    }
    // Logged here rather than in load_config: logging is not up yet there.
    match &config_source {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(2);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!("Monitor failed: {}", e);
        std::process::exit(1);
    }
}

/// Config comes from the first CLI argument when given, otherwise from
/// `config.yaml` next to the executable or in the working directory.
/// A missing file falls back to defaults; a present-but-broken file does
/// not. Returns the path the config came from so the caller can log it
/// once logging is initialized.
fn load_config() -> (Config, Option<PathBuf>) {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let exe_dir_config = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("config.yaml")));

    let candidates: Vec<PathBuf> = explicit
        .clone()
        .into_iter()
        .chain(exe_dir_config)
        .chain(std::iter::once(PathBuf::from("config.yaml")))
        .collect();

    for path in candidates {
        if path.exists() {
            match Config::load(&path) {
                Ok(cfg) => return (cfg, Some(path)),
                Err(e) => {
                    eprintln!("Failed to load config {}: {}", path.display(), e);
                    std::process::exit(2);
                }
            }
        } else if explicit.as_deref() == Some(path.as_path()) {
            eprintln!("Config file {} not found", path.display());
            std::process::exit(2);
        }
    }
    (Config::default(), None)
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let client_id = config.client_id();
    info!("=== Network Flow Monitor ===");
    info!("Client: {}", client_id);
    info!("Collector: {}", config.collector.base_url);

    let metrics = Arc::new(Metrics::new());
    let client = HttpCollector::new(
        &config.collector.base_url,
        Duration::from_secs(config.collector.request_timeout_secs),
    )?;

    // Registration is best effort: an unreachable collector must not stop
    // capture, staging will cover the gap.
    match client.register_device(&DeviceIdentity::new(&client_id)).await {
        Ok(()) => info!("Device registered with collector"),
        Err(e) => warn!("Device registration failed ({}); continuing offline", e),
    }

    let staging = StagingArea::open(Path::new(&config.export.staging_dir))?;

    let (frame_tx, frame_rx) = mpsc::channel::<RawFrame>(FRAME_CHANNEL_CAPACITY);
    let (export_tx, export_rx) = mpsc::channel(EXPORT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    let exporter = BatchExporter::new(
        client,
        client_id,
        config.export.clone(),
        staging,
        metrics.clone(),
    )?;
    let exporter_handle = tokio::spawn(exporter.run(export_rx));

    let aggregator = FlowAggregator::new(&config.flow, export_tx, metrics.clone());
    let mut aggregator_handle = tokio::spawn(aggregator.run(frame_rx, shutdown_rx));

    let capture_cfg = config.capture.clone();
    let capture_handle = tokio::spawn(async move {
        let result = match (&capture_cfg.pcap_file, &capture_cfg.command) {
            (Some(path), _) => {
                info!("Reading capture file {}", path);
                match tokio::fs::File::open(path).await {
                    Ok(file) => capture::pump(file, frame_tx).await.map_err(|e| e.to_string()),
                    Err(e) => Err(format!("cannot open {}: {}", path, e)),
                }
            }
            (None, Some(command)) => capture::pump_command(command, &capture_cfg.args, frame_tx)
                .await
                .map_err(|e| e.to_string()),
            (None, None) => {
                info!("Reading pcap stream from stdin");
                capture::pump(tokio::io::stdin(), frame_tx)
                    .await
                    .map_err(|e| e.to_string())
            }
        };
        if let Err(e) = result {
            error!("Capture failed: {}", e);
        }
    });

    // Run until the capture stream ends (the aggregator sees the closed
    // channel and flushes) or until ctrl-c asks for shutdown.
    tokio::select! {
        _ = &mut aggregator_handle => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Cannot listen for ctrl-c: {}", e);
            }
            info!("Shutdown requested");
            let _ = shutdown_tx.send(()).await;
            capture_handle.abort();
            if let Err(e) = aggregator_handle.await {
                if !e.is_cancelled() {
                    warn!("Aggregator task error: {}", e);
                }
            }
        }
    }

    // The aggregator has dropped its exporter channel; give the exporter its
    // grace period (plus slack) to drain and stage.
    let drain_budget = Duration::from_secs(config.export.shutdown_grace_secs + 5);
    match tokio::time::timeout(drain_budget, exporter_handle).await {
        Ok(Ok(())) => info!("Exporter drained"),
        Ok(Err(e)) => warn!("Exporter task error: {}", e),
        Err(_) => warn!("Exporter did not drain within {:?}", drain_budget),
    }

    info!("Final status: {}", metrics.snapshot());
    info!("Network flow monitor stopped");
    Ok(())
}
