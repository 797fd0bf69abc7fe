//! echo-bench: an echo RPC server and a throughput load generator
//!
//! Two subcommands:
//! - `serve` answers `Get(key)` with `key` over a framed TCP protocol
//! - `bench` drives a server with many concurrent Workers sharing one
//!   connection and prints completed calls per interval, one per line
//!
//! Any failed or wrong call stops the whole run with a non-zero exit.
//! Configuration via CLI arguments or TOML file.

mod bench;
mod client;
mod config;
mod error;
mod protocol;
mod server;
mod service;

use bench::{LineReporter, LoadGenerator};
use client::RpcClient;
use config::{BenchSettings, Config, Mode, ServerSettings};
use error::HarnessError;
use server::Server;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout carries only the per-interval counts
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    tokio::spawn(handle_ctrl_c(cancel.clone()));

    match config.mode {
        Mode::Serve(settings) => run_server(settings, cancel).await,
        Mode::Bench(settings) => run_bench(settings, cancel).await,
    }
}

async fn run_server(
    settings: ServerSettings,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %settings.listen,
        max_connections = settings.max_connections,
        "Starting echo server"
    );

    let server = Server::bind(&settings).await?;
    server.run(cancel).await?;
    Ok(())
}

async fn run_bench(
    settings: BenchSettings,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        addr = %settings.addr,
        workers = settings.workers,
        key_len = settings.key.len(),
        "Starting load generator"
    );

    let client = RpcClient::connect(&settings.addr)
        .await
        .map_err(|source| HarnessError::Connect {
            addr: settings.addr.clone(),
            source,
        })?;

    let generator = LoadGenerator::new(Arc::new(client), settings);
    let summary = generator.run(LineReporter::stdout(), cancel).await?;

    info!(
        total = summary.total,
        calls_per_sec = summary.rate().round() as u64,
        "Load generator stopped"
    );
    Ok(())
}

/// First Ctrl+C stops the run gracefully, a second one exits immediately.
async fn handle_ctrl_c(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    warn!("Received Ctrl+C, stopping");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Received second Ctrl+C, exiting");
        std::process::exit(1);
    }
}
