//! Application wiring and lifecycle
//!
//! Builds the sink stack from configuration, launches telemetry, the
//! dispatcher pool and the replication client, and coordinates graceful
//! shutdown on SIGINT/SIGTERM.

use crate::checkpoint::CheckpointTracker;
use crate::client::ReplicationClient;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::monitoring::{parse_metrics_addr, MetricsServer};
use crate::sinks::{
    BroadcastSink, ClickHouseSink, PostgresSink, RedisSink, RetrySink, Sink,
};
use crate::types::Lsn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Grace period given to the pipeline to drain after shutdown is requested
const SHUTDOWN_DRAIN_WINDOW: Duration = Duration::from_secs(10);

/// Run the replicator until the replication client stops or a shutdown
/// signal arrives
pub async fn run(config: Config) -> Result<()> {
    let metrics_addr = parse_metrics_addr(&config.telemetry.address)?;
    tokio::spawn(async move {
        let server = MetricsServer::new(metrics_addr);
        if let Err(e) = server.start().await {
            error!("Telemetry server failed: {}", e);
        }
    });

    info!(slot = %config.source.slot_name, "Starting replicator");

    let shutdown = CancellationToken::new();
    let tracker = Arc::new(CheckpointTracker::new(Lsn(0)));

    let broadcast = build_sinks(&config, shutdown.clone()).await?;
    let broadcast: Arc<dyn Sink> = Arc::new(broadcast);

    let (events_tx, events_rx) = mpsc::channel(config.pipeline.buffer_size.max(1));
    let dispatcher = Dispatcher::spawn(
        &config.pipeline,
        broadcast.clone(),
        tracker.clone(),
        shutdown.clone(),
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(events_rx));

    let client = ReplicationClient::new(config.source.clone(), tracker.clone(), events_tx);
    let client_handle = tokio::spawn(client.run(shutdown.clone()));

    let outcome = tokio::select! {
        result = client_handle => {
            match result {
                Ok(Ok(())) => {
                    info!("Replication client stopped");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!("Replication client failed: {}", e);
                    Err(e)
                }
                Err(e) => {
                    error!("Replication client panicked: {}", e);
                    Err(crate::error::CdcError::generic(format!(
                        "replication task failed: {}",
                        e
                    )))
                }
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping replication gracefully");
            Ok(())
        }
    };

    // Stop the producer and let the workers drain their queues. Dropping
    // the client ends the event channel, which closes the worker inputs.
    shutdown.cancel();
    if tokio::time::timeout(SHUTDOWN_DRAIN_WINDOW, dispatcher_handle)
        .await
        .is_err()
    {
        warn!("Pipeline did not drain within the shutdown window");
    }

    if let Err(e) = broadcast.close().await {
        warn!("Error closing sinks: {}", e);
    }

    info!(safe_lsn = %tracker.safe_lsn(), "Replicator stopped");
    outcome
}

/// Construct every configured target, wrap each in its retry policy and
/// aggregate them under one broadcast decorator
async fn build_sinks(config: &Config, shutdown: CancellationToken) -> Result<BroadcastSink> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();

    for target in &config.targets.postgres {
        let sink = PostgresSink::connect(target).await?;
        sinks.push(with_retry(
            Box::new(sink),
            &target.base,
            shutdown.clone(),
        ));
        info!(name = %target.base.name, "Initialized PostgreSQL sink");
    }

    for target in &config.targets.clickhouse {
        let sink = ClickHouseSink::connect(target)?;
        sinks.push(with_retry(
            Box::new(sink),
            &target.base,
            shutdown.clone(),
        ));
        info!(name = %target.base.name, "Initialized ClickHouse sink");
    }

    for target in &config.targets.redis {
        let sink = RedisSink::connect(target).await?;
        sinks.push(with_retry(
            Box::new(sink),
            &target.base,
            shutdown.clone(),
        ));
        info!(name = %target.base.name, "Initialized Redis sink");
    }

    Ok(BroadcastSink::new(sinks))
}

fn with_retry(
    inner: Box<dyn Sink>,
    base: &crate::config::TargetBase,
    shutdown: CancellationToken,
) -> Box<dyn Sink> {
    Box::new(RetrySink::new(
        base.name.clone(),
        inner,
        base.retry.max_attempts(),
        base.retry.backoff(),
        shutdown,
    ))
}

/// Resolve on SIGINT or SIGTERM (Ctrl+C on Windows)
async fn shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("failed to listen for ctrl-c");
        info!("Received Ctrl+C");
    }
}
