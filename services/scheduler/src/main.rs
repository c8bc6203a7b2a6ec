//! brig Scheduler
//!
//! Admits queued Workers and Jobs against cluster capacity. Runs until
//! interrupted or until a fatal error (broker unreachable, project listing
//! failed, initial pod sync failed), in which case it exits non-zero.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use brig_scheduler::api::ApiClient;
use brig_scheduler::queue::{AmqpReaderFactory, QueueReaderFactory};
use brig_scheduler::substrate::KubeClient;
use brig_scheduler::{Config, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // RUST_LOG wins over BRIG_LOG_LEVEL
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        api_address = %config.api.address,
        amqp_address = %config.amqp.address,
        max_concurrent_workers = config.scheduler.max_concurrent_workers,
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        "Starting brig scheduler"
    );

    let api = Arc::new(ApiClient::new(&config.api).context("building API client")?);
    let pods = Arc::new(KubeClient::new(&config.kube).context("building Kubernetes client")?);
    let queues = Arc::new(
        AmqpReaderFactory::connect(config.amqp.clone())
            .await
            .context("connecting to message broker")?,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Unable to listen for shutdown signal"),
            }
        }
    });

    let scheduler = Scheduler::new(config.scheduler.clone(), api, pods, queues.clone());
    let result = scheduler.run(shutdown).await;

    if let Err(e) = queues.close().await {
        warn!(error = %e, "Error closing broker connection");
    }

    result?;
    info!("Scheduler shutdown complete");
    Ok(())
}
