//! Subcommand implementations.

use std::sync::Arc;

use anyhow::{Context, Result};
use apalis::prelude::*;
use apalis_redis::RedisStorage;
use courier_common::Config;
use courier_db::repositories::PublishQueueRepository;
use courier_queue::{
    ApalisTaskQueue, DispatchScheduler, HTTP_PUSH_DELIVERY_TYPE, HttpPushTransmitter,
    InMemoryLock, LocalTaskQueue, QueueStore, RedisLock, TransmitBatchJob, TransmitContext,
    TransmitSubscriberJob, TransmitterRegistry, run_local_executor, transmit_batch_worker,
    transmit_subscriber_worker,
};
use fred::interfaces::ClientLike;
use tokio::signal;
use tracing::{error, info};

use crate::cli::{ServeArgs, TransmitArgs};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn user_agent() -> String {
    format!("courier/{}", env!("CARGO_PKG_VERSION"))
}

/// Transmitters available to this process.
fn build_registry() -> Result<TransmitterRegistry> {
    let mut registry = TransmitterRegistry::new();
    registry.register(
        HTTP_PUSH_DELIVERY_TYPE,
        Arc::new(HttpPushTransmitter::new(user_agent())?),
    )?;

    info!(delivery_types = ?registry.delivery_types(), "Transmitters registered");
    Ok(registry)
}

async fn connect_fred(config: &Config) -> Result<Arc<fred::clients::Client>> {
    let fred_config = fred::types::config::Config::from_url(&config.redis.url)
        .context("Failed to parse Redis URL")?;
    let client = fred::clients::Client::new(fred_config, None, None, None);
    client.connect();
    client
        .wait_for_connect()
        .await
        .context("Failed to connect to Redis")?;
    Ok(Arc::new(client))
}

async fn job_storages(
    config: &Config,
) -> Result<(RedisStorage<TransmitBatchJob>, RedisStorage<TransmitSubscriberJob>)> {
    let redis_client =
        redis::Client::open(config.redis.url.as_str()).context("Failed to create Redis client")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("Failed to connect to Redis job queue")?;

    Ok((
        RedisStorage::new(redis_conn.clone()),
        RedisStorage::new(redis_conn),
    ))
}

/// `courier migrate`
pub async fn run_migrate(config: &Config) -> Result<()> {
    let db = courier_db::init(config).await?;
    info!("Running database migrations...");
    courier_db::migrate(&db).await?;
    info!("Migrations completed");
    Ok(())
}

/// `courier transmit`
///
/// Errors are logged, never surfaced: the request is fire-and-forget.
pub async fn run_transmit(config: &Config, args: &TransmitArgs) -> Result<()> {
    let (batches, subscribers) = match job_storages(config).await {
        Ok(storages) => storages,
        Err(e) => {
            error!(error = %e, "Could not reach the job queue, no batch run requested");
            return Ok(());
        }
    };

    let tasks = Arc::new(ApalisTaskQueue::new(batches, subscribers));
    DispatchScheduler::new(tasks, config.transmit.schedule_interval())
        .with_delivery_type(args.provider_type.clone())
        .trigger()
        .await;

    info!(provider_type = ?args.provider_type, "Batch run requested");
    Ok(())
}

/// `courier serve`
pub async fn run_serve(config: &Config, args: &ServeArgs) -> Result<()> {
    let db = courier_db::init(config).await?;
    info!("Connected to database");

    info!("Running database migrations...");
    courier_db::migrate(&db).await?;
    info!("Migrations completed");

    let store: Arc<dyn QueueStore> = Arc::new(PublishQueueRepository::new(Arc::new(db)));
    let registry = Arc::new(build_registry()?);

    if args.local {
        serve_local(config, args, store, registry).await
    } else {
        serve_distributed(config, args, store, registry).await
    }
}

async fn serve_local(
    config: &Config,
    args: &ServeArgs,
    store: Arc<dyn QueueStore>,
    registry: Arc<TransmitterRegistry>,
) -> Result<()> {
    info!("Starting in-process transmit executor");

    let (tasks, receiver) = LocalTaskQueue::channel(config.transmit.task_queue_capacity);
    let tasks = Arc::new(tasks);
    let ctx = TransmitContext::new(
        store,
        Arc::new(InMemoryLock::new()),
        registry,
        tasks.clone(),
        config.transmit.clone(),
    );

    let executor = tokio::spawn(run_local_executor(receiver, ctx));
    let scheduler = DispatchScheduler::new(tasks, config.transmit.schedule_interval())
        .with_delivery_type(args.provider_type.clone())
        .spawn();

    shutdown_signal().await;

    scheduler.abort();
    executor.abort();
    info!("Shutdown complete");
    Ok(())
}

async fn serve_distributed(
    config: &Config,
    args: &ServeArgs,
    store: Arc<dyn QueueStore>,
    registry: Arc<TransmitterRegistry>,
) -> Result<()> {
    info!("Connecting to Redis...");
    let fred_client = connect_fred(config).await?;
    let locks = Arc::new(RedisLock::new(fred_client, config.redis.prefix.clone()));

    let (batches, subscribers) = job_storages(config).await?;
    info!("Connected to Redis job queue");

    let tasks = Arc::new(ApalisTaskQueue::new(batches.clone(), subscribers.clone()));
    let ctx = TransmitContext::new(store, locks, registry, tasks.clone(), config.transmit.clone());

    let scheduler = DispatchScheduler::new(tasks, config.transmit.schedule_interval())
        .with_delivery_type(args.provider_type.clone())
        .spawn();

    let monitor = Monitor::new()
        .register(
            WorkerBuilder::new("transmit-batch")
                .concurrency(1)
                .data(ctx.clone())
                .backend(batches)
                .build_fn(transmit_batch_worker),
        )
        .register(
            WorkerBuilder::new("transmit-subscriber")
                .concurrency(config.transmit.executor_concurrency.max(1))
                .data(ctx)
                .backend(subscribers)
                .build_fn(transmit_subscriber_worker),
        );

    info!(
        concurrency = config.transmit.executor_concurrency,
        "Transmit workers started"
    );

    let result = monitor
        .run_with_signal(async {
            shutdown_signal().await;
            Ok(())
        })
        .await;

    scheduler.abort();
    result.context("Transmit workers failed")?;
    info!("Shutdown complete");
    Ok(())
}
