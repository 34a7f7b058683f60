//! tg-sync
//!
//! Syncs one ELBv2 target group with the running EC2 instances whose name
//! matches a prefix, then exits, sleeps until terminated, or keeps looping.
//!
//! Exit status: 0 on success, 1 when a pass fails, 2 on bad configuration.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tg_sync::{AwsProvider, Config, Driver, RunSummary, SyncError};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    // Initialize tracing (prefer RUST_LOG, fallback to AWS_SYNC_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        target_group = %config.target_group_name,
        instance_name_prefix = %config.instance_name_prefix,
        port = config.instance_port.get(),
        dry_run = config.dry_run,
        provider = ?config.provider,
        "Configuration loaded"
    );

    match run(config).await {
        Ok(summary) => {
            info!(
                succeeded_passes = summary.succeeded_passes,
                failed_passes = summary.failed_passes,
                "tg-sync finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "tg-sync failed");
            ExitCode::from(exit_status(&e))
        }
    }
}

async fn run(config: Config) -> Result<RunSummary> {
    let provider = Arc::new(AwsProvider::connect(&config.provider).await);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("Received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
            // Dropping the sender leaves the driver blocked until the process is killed.
            Err(e) => warn!(error = %format!("{e:#}"), "Signal handling unavailable"),
        }
    });

    let mut driver = Driver::new(config, provider.clone(), provider);
    driver
        .run(shutdown_rx)
        .await
        .context("target group sync failed")
}

fn exit_status(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::Configuration(_)) => 2,
        _ => 1,
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")
    }
}
