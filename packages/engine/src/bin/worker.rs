// Worker entry point: broker consumption plus the recovery loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use engine_core::kernel::{
    BrokerPolicy, Dispatcher, EngineKernel, Generator, HttpStoreApiFactory, PgBroker, PgJobStore,
    PgTenantDirectory, PgUsageLedger, RedisTenantLocks,
};
use engine_core::Config;
use generator_client::GeneratorClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,engine_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting SEO batch worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    // The broker may ride a separate database.
    let queue_pool = if config.queue_url == config.database_url {
        pool.clone()
    } else {
        PgPoolOptions::new()
            .max_connections(5)
            .connect(&config.queue_url)
            .await
            .context("Failed to connect to queue database")?
    };

    tracing::info!("Connecting to KV store...");
    let locks = RedisTenantLocks::connect(&config.kv_url).await?;

    let completer = GeneratorClient::new(
        &config.generator_api_url,
        &config.generator_api_key,
        &config.generator_model,
        config.generator_timeout,
    )
    .context("Failed to build generator client")?;

    let settings = config.engine_settings();
    let worker_id = EngineKernel::worker_id();
    tracing::info!(worker_id = %worker_id, "worker identity assigned");

    let broker = Arc::new(PgBroker::new(queue_pool, BrokerPolicy::default()));
    let kernel = Arc::new(EngineKernel {
        store: Arc::new(PgJobStore::new(pool.clone())),
        usage: Arc::new(PgUsageLedger::new(pool.clone(), config.free_time_zone)),
        locks: Arc::new(locks),
        broker: broker.clone(),
        tenants: Arc::new(PgTenantDirectory::new(pool.clone())),
        generator: Arc::new(Generator::new(
            Arc::new(completer),
            config.generator_config(),
        )),
        store_apis: Arc::new(HttpStoreApiFactory::new(config.store_api_config())?),
        settings: settings.clone(),
        worker_id,
    });

    let shutdown = Arc::new(AtomicBool::new(false));

    // Signal handler
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    // Recovery loop
    let recovery = {
        let store = kernel.store.clone();
        let shutdown = shutdown.clone();
        let interval = settings.recovery_interval;
        let stale_after = settings.stuck_after;
        tokio::spawn(async move {
            engine_core::kernel::recovery::run_recovery_loop(store, interval, stale_after, shutdown)
                .await;
        })
    };

    // Consume until shutdown.
    let dispatcher = Arc::new(Dispatcher::new(kernel));
    broker.run(dispatcher, shutdown).await?;

    recovery.await.ok();
    tracing::info!("worker stopped");
    Ok(())
}
