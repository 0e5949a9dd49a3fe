//! steward-daemon - Reconciliation daemon.
//!
//! Assembles the overlord with the built-in managers and drives it: one
//! reconciliation tick per interval, plus an immediate tick on startup, and
//! a clean stop with a final checkpoint on SIGTERM/SIGINT.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use steward_core::config::StewardConfig;
use steward_core::overlord::OverlordBuilder;
use steward_core::quota::{ControlError, QuotaGroup, QuotaManager, ServiceControl};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// steward daemon - task and change reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "steward-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "steward.toml")]
    config: PathBuf,

    /// Override the state directory from the config file
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Service-control backend that records every operation in the log without
/// touching the host. Stands in until a service-manager backend is wired up.
struct LoggingControl;

#[async_trait]
impl ServiceControl for LoggingControl {
    async fn create_slice(&self, group: &QuotaGroup) -> Result<(), ControlError> {
        info!(group = %group.name, limit = group.memory_limit, "create slice");
        Ok(())
    }

    async fn start_slice(&self, name: &str) -> Result<(), ControlError> {
        info!(group = name, "start slice");
        Ok(())
    }

    async fn stop_slice(&self, name: &str) -> Result<(), ControlError> {
        info!(group = name, "stop slice");
        Ok(())
    }

    async fn remove_slice(&self, name: &str) -> Result<(), ControlError> {
        info!(group = name, "remove slice");
        Ok(())
    }

    async fn update_slice(&self, group: &QuotaGroup) -> Result<(), ControlError> {
        info!(group = %group.name, limit = group.memory_limit, "update slice");
        Ok(())
    }

    async fn restart_service(&self, snap: &str) -> Result<(), ControlError> {
        info!(snap, "restart services");
        Ok(())
    }
}

fn load_config(args: &Args) -> Result<StewardConfig> {
    let mut config = if args.config.exists() {
        StewardConfig::from_file(&args.config)
            .with_context(|| format!("loading config from {}", args.config.display()))?
    } else {
        info!(path = %args.config.display(), "no config file, using defaults");
        StewardConfig::default()
    };
    if let Some(state_dir) = &args.state_dir {
        config.state_dir.clone_from(state_dir);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&args)?;
    info!(
        state_dir = %config.state_dir.display(),
        interval = ?config.ensure_interval,
        "starting steward daemon"
    );

    let mut builder = OverlordBuilder::new(&config.state_dir)
        .runner_config(config.runner.clone())
        .prune_wait(config.prune_wait);
    let quota = QuotaManager::new(builder.registry(), Arc::new(LoggingControl));
    builder.add_manager(Box::new(quota));

    let mut overlord = builder.build().context("assembling overlord")?;

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut ticker = tokio::time::interval(config.ensure_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A failed pass is retried on the next tick; partial
                // progress is already checkpointed.
                if let Err(err) = overlord.ensure().await {
                    warn!(%err, "reconciliation pass failed");
                }
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            },
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            },
        }
    }

    if let Err(err) = overlord.stop().await {
        error!(%err, "shutdown incomplete");
        return Err(err.into());
    }
    info!("steward daemon stopped");
    Ok(())
}
