//! Periodic status reporting toward the Controller.
//!
//! Assembles a read-only snapshot of every workload plus the latest host
//! telemetry and hands it to a [`StatusSink`]. The Controller-sync
//! collaborator supplies the real sink; the agent ships a logging sink so
//! reports are observable without one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::TaskQueue;
use crate::status::{ElementState, ElementStatus, StatusStore};
use crate::telemetry::{ResourceConsumptionManagerStatus, ResourceManagerStatus, TelemetryStore};

/// Reported snapshot of one workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementStatusReport {
    pub element_id: String,
    pub state: ElementState,
    pub start_time: Option<DateTime<Utc>>,
    /// Seconds spent running; present only while the workload runs.
    pub operating_duration_secs: Option<i64>,
    pub cpu_usage: f64,
    pub memory_usage: u64,
    pub last_error: Option<String>,
}

impl ElementStatusReport {
    fn from_status(element_id: String, status: &ElementStatus) -> Self {
        Self {
            element_id,
            state: status.state,
            start_time: status.start_time,
            operating_duration_secs: status.operating_duration().map(|d| d.num_seconds()),
            cpu_usage: status.cpu_usage,
            memory_usage: status.memory_usage,
            last_error: status.last_error.clone(),
        }
    }
}

/// One full agent status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub agent_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Tasks still pending in the queue, backoffs included.
    pub pending_tasks: usize,
    pub elements: Vec<ElementStatusReport>,
    pub resources: Option<ResourceManagerStatus>,
    pub consumption: Option<ResourceConsumptionManagerStatus>,
}

/// Destination for assembled reports.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, report: &AgentStatusReport) -> anyhow::Result<()>;
}

/// Sink that writes reports to the structured log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn publish(&self, report: &AgentStatusReport) -> anyhow::Result<()> {
        let failed = report
            .elements
            .iter()
            .filter(|e| e.state == ElementState::FailedVerification)
            .count();
        info!(
            agent_id = %report.agent_id,
            elements = report.elements.len(),
            failed,
            pending_tasks = report.pending_tasks,
            "Agent status report"
        );
        debug!(report = %serde_json::to_string(report)?, "Full status report");
        Ok(())
    }
}

/// Assemble a report from the current store contents.
pub fn build_report(
    agent_id: Uuid,
    queue: &TaskQueue,
    status: &StatusStore,
    telemetry: &TelemetryStore,
) -> AgentStatusReport {
    let elements = status
        .snapshot()
        .into_iter()
        .map(|(id, status)| ElementStatusReport::from_status(id, &status))
        .collect();

    AgentStatusReport {
        agent_id,
        timestamp: Utc::now(),
        pending_tasks: queue.len(),
        elements,
        resources: telemetry.resources(),
        consumption: telemetry.consumption(),
    }
}

/// Run the reporting loop until shutdown.
pub async fn run_reporter_loop(
    agent_id: Uuid,
    queue: Arc<TaskQueue>,
    status: Arc<StatusStore>,
    telemetry: Arc<TelemetryStore>,
    sink: Arc<dyn StatusSink>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        agent_id = %agent_id,
        interval_secs = interval.as_secs(),
        "Starting status reporter"
    );

    let mut consecutive_failures = 0u32;
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = build_report(agent_id, &queue, &status, &telemetry);
                match sink.publish(&report).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Status publish failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Status publish failed repeatedly");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Status reporter shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_report_snapshots_elements() {
        let queue = TaskQueue::new();
        let status = StatusStore::new();
        let telemetry = TelemetryStore::new();

        status.mark_building("svc1");
        status.mark_starting("svc1", "ctr_1");
        status.mark_running("svc1");
        status.set_usage("svc1", 7.5, 128 * 1024 * 1024);
        status.mark_failed("svc2", "invalid image reference: :bad:");

        let report = build_report(Uuid::new_v4(), &queue, &status, &telemetry);

        assert_eq!(report.elements.len(), 2);
        let svc1 = &report.elements[0];
        assert_eq!(svc1.element_id, "svc1");
        assert_eq!(svc1.state, ElementState::Running);
        assert!(svc1.operating_duration_secs.is_some());
        assert_eq!(svc1.cpu_usage, 7.5);

        let svc2 = &report.elements[1];
        assert_eq!(svc2.state, ElementState::FailedVerification);
        assert!(svc2.last_error.as_deref().unwrap().contains("invalid image"));
        assert!(svc2.operating_duration_secs.is_none());
    }

    #[test]
    fn test_report_serialization() {
        let queue = TaskQueue::new();
        let status = StatusStore::new();
        let telemetry = TelemetryStore::new();
        status.mark_building("svc1");
        telemetry.set_resources(ResourceManagerStatus {
            hw_info: "arm64".to_string(),
            usb_info: "none".to_string(),
        });

        let report = build_report(Uuid::new_v4(), &queue, &status, &telemetry);
        let json = serde_json::to_string(&report).unwrap();

        assert!(json.contains("\"state\":\"building\""));
        assert!(json.contains("\"hw_info\":\"arm64\""));
        assert!(json.contains("\"pending_tasks\":0"));
    }
}
