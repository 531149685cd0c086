//! Sierra webhook worker.
//!
//! Runs the delivery engine against PostgreSQL and serves the operator API.
//! On shutdown the scheduler stops ticking and in-flight deliveries are
//! allowed to finish before the process exits.

mod config;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use sierra_webhooks::store::postgres::run_migrations;
use sierra_webhooks::{PgWebhookStore, WebhookEngine};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::info;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env file: {e}");
        }
    }

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    logging::init_logging(&config.log_filter);

    info!(
        listen_addr = %config.listen_addr,
        concurrency = config.webhook.scheduler.concurrency,
        poll_interval_ms = config.webhook.scheduler.poll_interval.as_millis() as u64,
        "Starting webhook worker"
    );

    let pool = match PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => {
            info!("Database connection established");
            pool
        }
        Err(e) => {
            eprintln!("Failed to connect to database: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_migrations(&pool).await {
        eprintln!("FATAL: Database migrations failed: {e}");
        std::process::exit(1);
    }

    let store = Arc::new(PgWebhookStore::new(pool));
    let engine = match WebhookEngine::builder(config.webhook.clone())
        .with_store(store)
        .build()
    {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("FATAL: Failed to build webhook engine: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.start().await {
        eprintln!("FATAL: Failed to start webhook scheduler: {e}");
        std::process::exit(1);
    }

    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to address {}: {e}", config.listen_addr);
            engine.shutdown().await;
            std::process::exit(1);
        }
    };

    info!(addr = %config.listen_addr, "Operator API listening");

    if let Err(e) = axum::serve(listener, engine.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {e}");
    }

    info!(
        in_flight = engine.scheduler().in_flight(),
        queue_depth = engine.queue().len(),
        "Stopping scheduler and draining in-flight deliveries"
    );
    engine.shutdown().await;
    info!("Webhook worker shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
