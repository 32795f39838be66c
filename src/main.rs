//! Command line entry point of the SPIFFE helper sidecar.

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use spiffe_helper::health::server;
use spiffe_helper::{Config, DiskWriter, ProcessManager, Sidecar, WorkloadApiClient};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "spiffe-helper")]
#[command(about = "Keeps SPIFFE X.509 and JWT SVIDs fresh on disk for a workload")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "helper.conf")]
    config: String,

    /// Keep running and renew credentials (overrides the config file)
    #[arg(long)]
    daemon_mode: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("Using configuration file: {}", args.config);

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;
    if let Some(daemon_mode) = args.daemon_mode {
        config.daemon_mode = Some(daemon_mode);
    }
    config.validate().context("invalid configuration")?;

    let client = WorkloadApiClient::new_from_path(&config.agent_address)
        .context("failed to create Workload API client")?;
    let sidecar = Arc::new(Sidecar::new(
        config.sidecar_settings(),
        Arc::new(client),
        Arc::new(DiskWriter::new(config.disk_config())),
        ProcessManager::new(config.process_config()?),
    ));

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone())?;

    let health = match config.health_server_config() {
        Some(health_config) if config.daemon_mode() => {
            let tracker = sidecar.health_tracker();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server::serve(health_config, tracker, cancel).await {
                    error!("Health listener failed: error={}", e);
                }
            }))
        }
        _ => None,
    };

    let result = sidecar.run(cancel.clone()).await;
    cancel.cancel();
    if let Some(health) = health {
        health.await?;
    }

    match result {
        Err(e) if e.is_cancelled() => {
            info!("Interrupted before the first update completed");
            Ok(())
        }
        result => result.context("sidecar failed"),
    }
}

fn spawn_shutdown_listener(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT; shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM; shutting down"),
        }
        cancel.cancel();
    });
    Ok(())
}
