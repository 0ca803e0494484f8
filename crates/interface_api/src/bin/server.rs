//! Lesson Billing - API Server Binary
//!
//! Starts the HTTP API server backed by in-memory adapters, plus a
//! background task that delivers queued billing notifications.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! cargo run --bin lesson-billing-api
//!
//! # Run with environment variables
//! API_HOST=127.0.0.1 API_PORT=3000 cargo run --bin lesson-billing-api
//! ```
//!
//! # Environment Variables
//!
//! * `API_HOST` - Server host (default: 0.0.0.0)
//! * `API_PORT` - Server port (default: 8080)
//! * `API_LOG_LEVEL` - Log level when `RUST_LOG` is unset (default: info)
//! * `API_OUTBOX_DISPATCH_INTERVAL_SECS` - Seconds between notification passes (default: 5)
//! * `API_OUTBOX_MAX_ATTEMPTS` - Delivery attempts before a notification is dropped (default: 5)

use anyhow::Context;
use interface_api::{config::ApiConfig, create_router, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use domain_billing::BillingEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (useful for local development)
    dotenvy::dotenv().ok();

    let config = ApiConfig::from_env().context("invalid API_* configuration")?;

    init_tracing(&config.log_level);

    tracing::info!(
        host = %config.host,
        port = %config.port,
        "Starting lesson billing API server"
    );

    let state = AppState::in_memory(config.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let dispatcher = tokio::spawn(run_outbox_dispatcher(
        state.engine.clone(),
        Duration::from_secs(config.outbox_dispatch_interval_secs.max(1)),
        config.outbox_max_attempts,
        stop_rx,
    ));

    let app = create_router(state);

    let addr: SocketAddr = config
        .server_addr()
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server_addr()))?;

    tracing::info!(%addr, "Server listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // One last pass so queued notifications are not lost on a clean exit
    let _ = stop_tx.send(true);
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "Outbox dispatcher task failed");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Delivers outbox entries on a fixed interval until told to stop.
async fn run_outbox_dispatcher(
    engine: Arc<BillingEngine>,
    every: Duration,
    max_attempts: u32,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                engine.dispatch_notifications(max_attempts).await;
                return;
            }
        }

        let report = engine.dispatch_notifications(max_attempts).await;
        if report.delivered + report.requeued + report.dropped > 0 {
            tracing::debug!(
                delivered = report.delivered,
                requeued = report.requeued,
                dropped = report.dropped,
                "Outbox dispatch pass"
            );
        }
    }
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
