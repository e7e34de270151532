//! Application entry point for the `satlink-telemetry` ingestion service.
//!
//! This binary orchestrates the full startup sequence for the telemetry
//! pipeline, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Opening the SQLite record store (schema created if missing)
//! - Restoring detector windows and sequencing state from the store
//! - Optionally serving the read-only query API
//! - Running the ingestion scheduler until Ctrl-C
//!
//! # Environment Variables
//! See [`satlink_telemetry::config::load_from_env`] for the pipeline options.
//! - `TELEMETRY_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `TELEMETRY_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! Configuration errors stop the process before any stream byte is read.
use std::env;

use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::{Context, Result};

use satlink_telemetry::{config, routes, scheduler, IngestCounters, Pipeline, Store};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env().context("invalid configuration")?;
    cfg.log_config();

    tracing::info!("Opening telemetry store: {}", cfg.db_url);
    let store = Store::connect(&cfg.db_url, cfg.db_pool_max)
        .await
        .with_context(|| format!("Failed to open store '{}'", cfg.db_url))?;

    let mut pipeline = Pipeline::open(&cfg, store.clone()).await?;

    let (counters_tx, counters_rx) = watch::channel(pipeline.counters().clone());
    let (stop_tx, stop_rx) = watch::channel(false);

    if let Some(addr) = cfg.http_addr {
        let app = routes::router(store.clone(), counters_rx.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Query API listening on {}", addr);

        let mut api_stop = stop_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = api_stop.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Query API failed: {}", e);
            }
        });
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        let _ = stop_tx.send(true);
    });

    scheduler::run(&mut pipeline, cfg.tick_interval, stop_rx, counters_tx).await;

    let IngestCounters {
        packets_inserted,
        crc_failures,
        anomaly_events,
        ..
    } = pipeline.counters().clone();
    tracing::info!(packets_inserted, crc_failures, anomaly_events, "Ingestion stopped");

    store.close().await;
    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `TELEMETRY_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `TELEMETRY_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("TELEMETRY_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to TELEMETRY_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("TELEMETRY_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
