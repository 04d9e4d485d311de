//! Hookline webhook ingestion and delivery service.
//!
//! Main entry point. Loads configuration, prepares the database, then runs
//! the HTTP API and the delivery engine until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_api::{server::shutdown_signal, start_server, AppState, Config};
use hookline_core::{storage::migrations, Clock, Metrics, RealClock, Storage};
use hookline_delivery::DeliveryEngine;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!("Starting hookline");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        environment = %config.environment,
        run_api = config.run_api,
        run_dispatcher = config.run_dispatcher,
        "Configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let applied = migrations::run(&pool).await.context("Failed to run database migrations")?;
    info!(applied, "Database migrations completed");

    let storage = Storage::new(pool.clone());
    let metrics = Arc::new(Metrics::new());
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let mut engine = DeliveryEngine::new(
        storage.clone(),
        config.to_delivery_config(),
        metrics.clone(),
        clock.clone(),
    )
    .context("Failed to create delivery engine")?;

    if config.run_dispatcher {
        engine.start();
        info!(workers = config.worker_count, "Delivery engine started");
    }

    let shutdown = CancellationToken::new();

    let server_handle = if config.run_api {
        let addr = config.parse_server_addr()?;
        let state = AppState::new(
            storage,
            engine.dead_letters(),
            metrics,
            clock,
            config.to_api_config(),
        );
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_server(state, addr, stop.cancelled_owned()).await {
                error!(error = %e, "Server failed");
            }
        }))
    } else {
        None
    };

    info!("hookline is ready");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");
    shutdown.cancel();

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Delivery engine did not stop cleanly");
    }

    if let Some(handle) = server_handle {
        let grace = Duration::from_secs(config.shutdown_grace_secs);
        if tokio::time::timeout(grace, handle).await.is_err() {
            info!("Server shutdown grace period expired");
        }
    }

    pool.close().await;
    info!("Database connections closed");

    info!("hookline shutdown complete");
    Ok(())
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured filter is used.
fn init_tracing(configured: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured))
        .or_else(|_| EnvFilter::try_new("info,hookline=debug,tower_http=debug"))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
