//! fog-agent
//!
//! Edge-node agent binary. Wires the task queue, reconciler, stats
//! collector, and status reporter together and runs them until a shutdown
//! signal arrives. The Controller-sync collaborator attaches to the queue,
//! the registry store, the snapshot accessors, and the hint channel.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fog_agent::config::Config;
use fog_agent::queue::TaskQueue;
use fog_agent::reconciler::Reconciler;
use fog_agent::report::{run_reporter_loop, LogSink, StatusSink};
use fog_agent::runtime::{ContainerRuntime, MockRuntime};
use fog_agent::stats::StatsCollector;
use fog_agent::status::StatusStore;
use fog_agent::task::RegistryStore;
use fog_agent::telemetry::TelemetryStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fog agent");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        agent_id = %config.agent_id,
        stats_interval_secs = config.stats_interval_secs,
        report_interval_secs = config.report_interval_secs,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Every component is built once here and passed to whoever needs it.
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new());
    let queue = Arc::new(TaskQueue::new());
    let status = Arc::new(StatusStore::new());
    let registries = Arc::new(RegistryStore::new());
    let telemetry = Arc::new(TelemetryStore::new());
    let (hint_tx, mut hint_rx) = mpsc::unbounded_channel();

    // Reconciler worker
    let reconciler = Reconciler::new(
        Arc::clone(&queue),
        Arc::clone(&status),
        Arc::clone(&registries),
        Arc::clone(&runtime),
        config.reconciler(),
    );
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Stats collector
    let collector = StatsCollector::new(
        Arc::clone(&status),
        Arc::clone(&runtime),
        std::time::Duration::from_secs(config.stats_interval_secs),
        hint_tx,
    );
    let stats_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            collector.run(shutdown_rx).await;
        }
    });

    // Status reporter
    let sink: Arc<dyn StatusSink> = Arc::new(LogSink);
    let reporter_handle = tokio::spawn(run_reporter_loop(
        config.agent_id,
        Arc::clone(&queue),
        Arc::clone(&status),
        Arc::clone(&telemetry),
        sink,
        std::time::Duration::from_secs(config.report_interval_secs),
        shutdown_rx.clone(),
    ));

    // Surface reconciliation hints until the Controller-sync collaborator
    // takes over the receiver.
    tokio::spawn(async move {
        while let Some(hint) = hint_rx.recv().await {
            info!(element_id = %hint.element_id, "Reconciliation hinted");
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reconciler_handle => {
            match result {
                Ok(()) => info!("Reconciler exited"),
                Err(e) => error!(error = %e, "Reconciler task panicked"),
            }
        }
        _ = stats_handle => {
            info!("Stats collector exited");
        }
        _ = reporter_handle => {
            info!("Status reporter exited");
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Give workers time to shut down gracefully
    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Agent shutdown complete");
    Ok(())
}
