use anyhow::{Context, Result};
use backrest_sidecar::config::{AppConfig, LogLevel};
use backrest_sidecar::{context, core::Orchestrator, logging};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use tokio::signal;

/// Trigger and list pgBackRest backups over HTTP.
///
/// Runs as a sidecar next to the database so that backups execute where
/// the data files are, while schedulers elsewhere only call the API.
#[derive(Parser, Serialize)]
#[command(name = "backrest-sidecar")]
#[command(about = "HTTP API for pgBackRest backups", long_about = None)]
struct Cli {
    /// Optional TOML configuration file
    #[serde(skip)]
    #[arg(long)]
    config: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short, long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none", rename = "log_level")]
    #[arg(long, value_enum)]
    loglevel: Option<LogLevel>,

    /// Stanza used by pgBackRest; defaults to $PGBACKREST_STANZA
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short, long)]
    stanza: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    pgbackrest_bin: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    history_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new(cli.config.as_deref(), Some(&cli))?;

    logging::init(logging::LogConfig {
        json: config.json_logs,
        level: config.log_level,
    });

    let ctx = context::AppContext::new(config);
    run_daemon(ctx).await.context("Backup sidecar failed")
}

async fn run_daemon(ctx: context::AppContext) -> Result<()> {
    let running = Orchestrator::new(ctx).start().await?;

    tokio::select! {
        result = shutdown_signal() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signals");
            }
        }
        _ = running.stopped() => {}
    }

    running.shutdown().await;
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    tracing::warn!("Received termination signal, shutting down");
    Ok(())
}
