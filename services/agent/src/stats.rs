//! Periodic resource-usage sampling for running workloads.
//!
//! The collector is the sole writer of the usage fields in the status
//! store; it never touches lifecycle state. When a container backing a
//! running workload has vanished it zeroes the usage fields and emits a
//! [`ReconcileHint`] for the Controller-sync collaborator to act on —
//! a signal, never a queued task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::status::StatusStore;

/// Signal that a running workload's container is missing and a fresh
/// desired/actual diff is warranted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileHint {
    pub element_id: String,
}

/// Interval sampler feeding the usage fields of the status store.
pub struct StatsCollector {
    status: Arc<StatusStore>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    hints: mpsc::UnboundedSender<ReconcileHint>,
}

impl StatsCollector {
    pub fn new(
        status: Arc<StatusStore>,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
        hints: mpsc::UnboundedSender<ReconcileHint>,
    ) -> Self {
        Self {
            status,
            runtime,
            interval,
            hints,
        }
    }

    /// Run the sampling loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting stats collector"
        );

        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Stats collector shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Sample every running workload once. Last sample wins; no averaging.
    pub async fn collect_once(&self) {
        for (element_id, container_id) in self.status.running_containers() {
            match self.runtime.sample_stats(&container_id).await {
                Ok(sample) => {
                    self.status
                        .set_usage(&element_id, sample.cpu_percent, sample.memory_bytes);
                }
                Err(RuntimeError::NotFound(_)) => {
                    warn!(
                        element_id = %element_id,
                        container_id = %container_id,
                        "Container missing for running workload, hinting reconciliation"
                    );
                    self.status.zero_usage(&element_id);
                    let _ = self.hints.send(ReconcileHint { element_id });
                }
                Err(e) => {
                    // Skip this tick; the next sample overwrites anyway.
                    debug!(
                        element_id = %element_id,
                        error = %e,
                        "Usage sample failed"
                    );
                }
            }
        }
    }
}
