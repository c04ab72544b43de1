//! sahay-daemon — the SAHAY backend service.
//!
//! Serves the consent-gated HTTP surface and runs the background scheduler
//! (SLA escalation, anchor submission, outbox dispatch, aggregation flush,
//! view refresh). Shuts down gracefully on SIGTERM/SIGINT, flushing the
//! aggregation buffer before exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sahay_core::Store;
use sahay_daemon::config::SahayConfig;
use sahay_daemon::http;
use sahay_daemon::scheduler;
use sahay_daemon::state::AppState;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// SAHAY backend daemon.
#[derive(Parser, Debug)]
#[command(name = "sahay-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "sahay.toml")]
    config: PathBuf,

    /// Bind address (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Database path (overrides the config file).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = if args.config.exists() {
        SahayConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!("no config file at {:?}, using defaults", args.config);
        SahayConfig::default()
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(database) = args.database {
        config.database.path = database;
    }

    let store = Store::open(&config.database.path)
        .with_context(|| format!("failed to open database at {:?}", config.database.path))?;
    let state = AppState::build(&config, store).context("failed to build service state")?;

    let scheduler_handles = scheduler::spawn_all(state.clone(), &config.scheduler);
    info!(jobs = scheduler_handles.len(), "scheduler started");

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(addr = %config.server.bind, "sahay-daemon listening");

    let app = http::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    for handle in scheduler_handles {
        handle.abort();
    }
    // Buffered aggregates survive the restart as database rows.
    match state.analytics.flush(chrono::Utc::now()) {
        Ok(flushed) => info!(flushed, "final aggregation flush complete"),
        Err(err) => warn!(error = %err, "final aggregation flush failed"),
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
