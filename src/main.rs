//! Ferry pub/sub gateway service.
//!
//! Connects the subscription catalog and the broker, starts one push worker
//! per push subscription, and coordinates graceful shutdown.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use ferry_broker::{Broker, PostgresBroker};
use ferry_core::{storage::Storage, RealClock};
use ferry_delivery::{DeliveryContext, DeliveryManager, HttpSender, PostgresSubscriptionStore};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting Ferry pub/sub gateway");

    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        broker_peers = config.broker_peers.len(),
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    storage.initialize().await.context("Failed to create catalog schema")?;
    info!("Catalog schema ready");

    let broker = Arc::new(
        PostgresBroker::initialize(&config.broker_peers)
            .await
            .context("Failed to connect to any broker peer")?,
    );
    info!("Broker connected");

    let result = run(&config, storage, broker.clone()).await;

    broker.close().await;
    info!("Broker connections closed");

    db_pool.close().await;
    info!("Database connections closed");

    match &result {
        Ok(()) => info!("Ferry shutdown complete"),
        Err(e) => error!(error = %e, "Ferry stopped with error"),
    }
    result
}

/// Runs the delivery manager until a shutdown signal arrives.
async fn run(config: &Config, storage: Arc<Storage>, broker: Arc<PostgresBroker>) -> Result<()> {
    let sender = HttpSender::new(config.delivery.client_config.clone())
        .context("Failed to build push HTTP client")?;

    let context = DeliveryContext::new(
        broker,
        Arc::new(PostgresSubscriptionStore::new(storage)),
        Arc::new(sender),
        Arc::new(RealClock::new()),
        config.delivery.clone(),
    );
    let manager = DeliveryManager::new(context);

    let loaded = manager.load_push_subs().await.context("Failed to load push subscriptions")?;
    let started = manager.start_all().await?;
    info!(loaded, started, "Ferry is delivering");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = manager.shutdown(config.delivery.shutdown_timeout).await {
        warn!(error = %e, "Push workers did not stop cleanly");
    }
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,ferry=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
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
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
