//! Button Audio GW - trigger-to-audio gateway for embedded hosts
//!
//! Bridges button trigger events (HTTP or serial-relayed) to local audio
//! playback, with USB hot-plug storage as an audio source and LED status
//! indication.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use button_audio_gw::api;
use button_audio_gw::config::AppConfig;
use button_audio_gw::coordinator::Coordinator;
use button_audio_gw::indicator::{LevelDrive, SoftLevelDrive};
use button_audio_gw::playback::RodioEngine;
use button_audio_gw::storage::{LsblkEnumerator, SystemMounter};

/// Button Audio Gateway - play mapped audio on button press/hold triggers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("Starting Button Audio GW...");
    info!("Configuration file: {}", args.config);

    let config = AppConfig::load(&args.config).await?;
    info!("Configuration loaded successfully");

    let engine = Arc::new(RodioEngine::new().context("Failed to open audio output")?);
    let drive: Arc<dyn LevelDrive> = Arc::new(SoftLevelDrive::new());

    let coordinator = Coordinator::new(
        config.clone(),
        engine,
        Arc::new(LsblkEnumerator),
        Arc::new(SystemMounter),
        drive,
    );

    coordinator.start().await;

    let bind = config.server.bind.clone();
    if let Err(e) = api::serve(coordinator.clone(), &bind, shutdown_signal()).await {
        warn!("API server exited with error: {:#}", e);
    }

    coordinator.shutdown().await;
    info!("Button Audio GW shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install CTRL+C signal handler: {}", e);
        return std::future::pending().await;
    }
    info!("Shutdown signal received");
}
