//! tcprelay
//!
//! Non-blocking TCP reverse proxy.
//!
//! This binary:
//! - Loads configuration from `RELAY_*` environment variables
//! - Binds the listener and starts the worker threads
//! - Logs a statistics snapshot every `RELAY_STATS_INTERVAL_MS`
//! - Stops the workers on ctrl-c

use std::sync::Arc;

use anyhow::{Context, Result};
use tcprelay::{Config, Relay, Stats};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tcprelay");
    info!(
        listen = %config.proxy.listen,
        backends = ?config.proxy.backends,
        workers = config.proxy.workers,
        max_sessions = config.proxy.max_sessions,
        zero_copy = %config.proxy.zero_copy,
        accept_mode = ?config.proxy.accept_mode,
        connect_on = ?config.proxy.effective_connect_on(),
        "Configuration loaded"
    );

    let relay = Relay::bind(config.proxy.clone()).context("Failed to bind listener")?;
    let handle = relay.spawn().context("Failed to start relay workers")?;
    let stats = Arc::clone(handle.stats());

    let mut ticker = tokio::time::interval(config.proxy.stats_interval);
    // The first tick completes immediately.
    ticker.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                match result {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
                break;
            }
            _ = ticker.tick() => log_stats(&stats),
        }
    }

    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .context("Relay shutdown task failed")?;
    log_stats(&stats);
    info!("tcprelay stopped");
    Ok(())
}

fn log_stats(stats: &Stats) {
    match serde_json::to_string(&stats.snapshot()) {
        Ok(snapshot) => info!(stats = %snapshot, "Relay statistics"),
        Err(e) => warn!(error = %e, "Failed to serialize statistics"),
    }
}
