//! Herald background job service.
//!
//! Loads service settings, bootstraps the configuration store, connects to
//! PostgreSQL, starts the configuration refresh loop and the email processor
//! engine, and shuts everything down on CTRL+C or SIGTERM.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::{storage, Clock, RealClock, TracingAuditLog};
use herald_processor::{
    BootstrapParams, ConfigStore, EmailDispatchJob, HmacTokenIssuer, HttpMailer, PgConfigSource,
    PgWorkQueue, ProcessorEngine,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting herald job processor");

    let config = ServiceConfig::load()?;
    info!(
        database_url = %config.database_url_masked(),
        namespace = %config.processor_namespace,
        relay = %config.mail_relay_url,
        "Configuration loaded"
    );

    let db_pool = create_lazy_pool(&config)?;
    let storage = storage::Storage::new(db_pool.clone());
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let background = CancellationToken::new();

    // The store must come up even when the pool cannot connect yet.
    let source = Arc::new(PgConfigSource::new(storage.configuration.clone()));
    let store = Arc::new(ConfigStore::bootstrap(source, BootstrapParams::from_env()).await);
    info!(entries = store.snapshot().len(), "Configuration store bootstrapped");

    wait_for_database(&db_pool).await?;
    info!("Database connection pool established");

    storage::migrate(&db_pool).await.context("failed to run migrations")?;
    info!("Database migrations completed");

    store.refresh().await;
    let refresh = store.spawn_refresh(config.refresh_interval(), background.clone());

    let job = EmailDispatchJob::new(
        Arc::new(PgWorkQueue::new(storage.pending_jobs.clone(), clock.clone())),
        Arc::new(HttpMailer::new(config.to_mailer_config())?),
        Arc::new(HmacTokenIssuer::new(
            config.token_secret.as_bytes(),
            &config.token_issuer,
            config.token_lifespan(),
            clock.clone(),
        )?),
        Arc::new(TracingAuditLog),
        clock.clone(),
    );

    let engine = ProcessorEngine::new(Arc::new(job), store, config.to_engine_config(), clock);
    engine.start().await?;
    info!(policy = ?engine.policy(), "Herald is processing jobs");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown(config.shutdown_timeout()).await {
        warn!(error = %e, "Engine did not stop cleanly");
    }
    let stats = engine.stats();
    info!(processed = stats.processed, failed = stats.failed_iterations, "Engine stopped");

    background.cancel();
    if let Err(e) = refresh.await {
        error!(error = %e, "Configuration refresh task failed");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Herald shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,herald=debug"))
        .context("invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool without opening a connection.
fn create_lazy_pool(config: &ServiceConfig) -> Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect_lazy(&config.database_url)
        .context("invalid database URL")
}

/// Waits until the pool can run a query, with retry logic.
async fn wait_for_database(pool: &sqlx::PgPool) -> Result<()> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match sqlx::query("SELECT 1").fetch_one(pool).await {
            Ok(_) => return Ok(()),
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
                return Err(e).context("failed to verify database connection after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_database() -> ServiceConfig {
        ServiceConfig {
            database_url: "postgresql://herald:pw@127.0.0.1:1/herald".to_string(),
            database_min_connections: 0,
            database_connection_timeout: 1,
            ..ServiceConfig::default()
        }
    }

    #[tokio::test]
    async fn store_bootstraps_before_database_is_reachable() {
        let pool = create_lazy_pool(&unreachable_database()).unwrap();
        let storage = storage::Storage::new(pool.clone());
        let source = Arc::new(PgConfigSource::new(storage.configuration.clone()));

        let store = ConfigStore::bootstrap(source, None).await;

        assert!(store.snapshot().is_empty());
        pool.close().await;
    }

    #[test]
    fn malformed_database_url_is_rejected() {
        let config =
            ServiceConfig { database_url: "not a url".to_string(), ..ServiceConfig::default() };
        assert!(create_lazy_pool(&config).is_err());
    }
}
