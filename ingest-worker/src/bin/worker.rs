//! Ingest Worker Binary
//!
//! Consumes every queue advertised by the platform's connector registry and
//! imports the messages back into the platform.

use anyhow::Context;
use ingest_worker::{
    telemetry, AmqpBroker, Config, HttpPlatformClient, MessageProcessor, PrometheusMetrics,
    Supervisor,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    telemetry::init_tracing(&config.worker)?;

    info!(platform = %config.platform.url, "Starting ingest worker");

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(PrometheusMetrics::new()?);

    let exporter = if config.telemetry.enabled {
        let addr = config.telemetry.listen_addr();
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = telemetry::serve_metrics(metrics, &addr, shutdown).await {
                error!(error = %e, "Prometheus exporter failed");
            }
        }))
    } else {
        None
    };

    let client = Arc::new(HttpPlatformClient::new(&config.platform)?);
    let processor = Arc::new(MessageProcessor::new(
        client.clone(),
        config.retry.clone(),
        metrics.clone(),
    ));
    let supervisor = Supervisor::new(
        client.clone(),
        Arc::new(AmqpBroker::new()),
        client,
        processor,
        config.worker.clone(),
    );

    let supervisor_handle = tokio::spawn(supervisor.run(shutdown.clone()));

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    info!("Shutting down ingest worker...");
    shutdown.cancel();

    supervisor_handle.await??;
    if let Some(exporter) = exporter {
        exporter.await?;
    }

    info!("Ingest worker stopped");
    Ok(())
}
