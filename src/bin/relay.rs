//! Stem Relay Application
//!
//! Captures audio, streams it to the separation backend and plays the
//! returned stems. Controlled over the HTTP API.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stem_relay::{
    audio::{device::list_devices, DeviceCaptureProvider, DeviceOutput},
    config::AppConfig,
    network::WebSocketTransport,
    protocol::{StartRequest, StatusKind},
    session::Session,
    ui::WebServer,
};

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Stream audio to a separation backend and play the stems")]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the backend WebSocket URL
    #[arg(long)]
    backend_url: Option<String>,

    /// List audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Start a session as soon as the relay is up
    #[arg(long)]
    autostart: bool,

    /// Separation model to request
    #[arg(long)]
    model: Option<String>,
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.list_devices {
        print_devices();
        return Ok(());
    }

    tracing::info!("Starting Stem Relay");

    let mut config = AppConfig::load(args.config.as_deref()).context("loading config")?;
    if let Some(url) = args.backend_url {
        config.backend.url = url;
    }
    if let Some(model) = args.model {
        config.model.model = model;
    }
    config.validate()?;
    tracing::info!("Backend: {}", config.backend.url);

    let output = DeviceOutput::open(config.playback.device_id.as_deref(), config.capture.sample_rate)
        .context("opening output device")?;
    let session = Session::new(
        config.clone(),
        Arc::new(WebSocketTransport),
        Arc::new(DeviceCaptureProvider),
        Arc::new(output),
    );

    // Mirror status events into the log
    let mut status = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            match event.kind {
                StatusKind::SessionFailed | StatusKind::ConnectionError => {
                    tracing::warn!("[{:?}] {}", event.kind, event.message)
                }
                _ => tracing::info!("[{:?}] {}", event.kind, event.message),
            }
        }
    });

    if config.ui.enabled {
        let server = WebServer::new(&config.ui, session.clone())?;
        tracing::info!("Web UI available at http://{}", server.addr());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Control surface stopped: {}", e);
            }
        });
    }

    if args.autostart {
        if let Err(e) = session.start(StartRequest::default()).await {
            tracing::error!("Autostart failed: {}", e);
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutting down...");
    session.stop();

    tracing::info!("Stem Relay stopped");
    Ok(())
}
