//! Reconciliation loop for converging workload state.
//!
//! One dedicated worker drains the task queue and turns each task into the
//! ordered runtime operations it implies: pull/create/start for deploys,
//! stop/remove for teardowns. Outcomes are classified against the retry
//! policy; a transient failure defers the task with backoff, a permanent
//! one drops it and fails the workload's verification. A failed task never
//! stops the loop from serving the next one.
//!
//! The reconciler is the sole writer of lifecycle fields in the status
//! store.

use std::sync::Arc;
use std::time::Duration;

use fog_reconcile::RetryPolicy;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::queue::TaskQueue;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::status::StatusStore;
use crate::task::{ContainerTask, RegistryStore, TaskAction};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Sleep between queue polls when nothing is eligible.
    pub idle_interval: Duration,

    /// Graceful window granted to a container before it is killed.
    pub stop_timeout: Duration,

    /// Transient-failure retry policy.
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Task-queue-driven reconciler.
pub struct Reconciler {
    queue: Arc<TaskQueue>,
    status: Arc<StatusStore>,
    registries: Arc<RegistryStore>,
    runtime: Arc<dyn ContainerRuntime>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        queue: Arc<TaskQueue>,
        status: Arc<StatusStore>,
        registries: Arc<RegistryStore>,
        runtime: Arc<dyn ContainerRuntime>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            queue,
            status,
            registries,
            runtime,
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            idle_interval_ms = self.config.idle_interval.as_millis() as u64,
            max_attempts = self.config.retry.max_attempts,
            "Starting reconciler loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(task) = self.queue.peek_next() else {
                // The only suspension point: bounded idle wait, interrupted
                // by shutdown.
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            self.run_task(task).await;
        }

        info!("Reconciler shutting down");
    }

    /// Execute at most one pending task. Returns whether one was executed.
    ///
    /// The loop is built from this; tests drive passes through it directly.
    pub async fn run_once(&self) -> bool {
        match self.queue.peek_next() {
            Some(task) => {
                self.run_task(task).await;
                true
            }
            None => false,
        }
    }

    async fn run_task(&self, task: ContainerTask) {
        let element_id = task.element_id.clone();
        let action = task.action;
        debug!(element_id = %element_id, action = %action, "Executing task");

        match self.execute(&task).await {
            Ok(()) => {
                self.queue.remove(&task);
                debug!(element_id = %element_id, action = %action, "Task completed");
            }
            Err(e) if e.is_transient() => self.handle_transient(&task, &e),
            Err(e) => self.handle_permanent(&task, &e),
        }
    }

    fn handle_transient(&self, task: &ContainerTask, error: &RuntimeError) {
        let retry = self.config.retry;
        let Some(attempts) = self.queue.defer(task, |n| retry.delay(n)) else {
            // Replaced or removed while executing; the newer intent wins.
            warn!(
                element_id = %task.element_id,
                error = %error,
                "Task vanished from queue during execution"
            );
            return;
        };

        if retry.exhausted(attempts) {
            self.queue.remove(task);
            self.status
                .mark_failed(&task.element_id, &format!("retries exhausted: {error}"));
            error!(
                element_id = %task.element_id,
                action = %task.action,
                attempts,
                error = %error,
                "Transient failures exhausted, giving up on task"
            );
        } else {
            warn!(
                element_id = %task.element_id,
                action = %task.action,
                attempts,
                error = %error,
                "Transient failure, task deferred"
            );
        }
    }

    fn handle_permanent(&self, task: &ContainerTask, error: &RuntimeError) {
        self.queue.remove(task);
        self.status.mark_failed(&task.element_id, &error.to_string());
        error!(
            element_id = %task.element_id,
            action = %task.action,
            error = %error,
            "Permanent failure, task dropped"
        );
    }

    async fn execute(&self, task: &ContainerTask) -> Result<(), RuntimeError> {
        match task.action {
            TaskAction::Add | TaskAction::Update => {
                // Replace-in-place: the previous container (an older spec,
                // or the leftover of a failed pass) must be fully gone
                // before the new one is created, or ports and names would
                // collide.
                self.teardown(&task.element_id, false).await?;
                self.deploy(task).await
            }
            TaskAction::Remove => self.teardown(&task.element_id, true).await,
        }
    }

    /// Pull, create, and start the task's container, in that order. The
    /// first failure aborts the remaining steps for this pass.
    async fn deploy(&self, task: &ContainerTask) -> Result<(), RuntimeError> {
        let element_id = &task.element_id;
        self.status.mark_building(element_id);

        let credentials = match &task.registry {
            Some(reference) => {
                let found = self.registries.find(&reference.url, &reference.user_email);
                if found.is_none() {
                    debug!(
                        element_id = %element_id,
                        registry = %reference.url,
                        "No credentials for registry, pulling anonymously"
                    );
                }
                found
            }
            None => None,
        };

        self.runtime
            .pull_image(&task.image, credentials.as_ref())
            .await?;

        let spec = task.to_spec();
        let container_id = self.runtime.create_container(&spec).await?;
        self.status.mark_starting(element_id, &container_id);

        self.runtime.start_container(&container_id).await?;
        self.status.mark_running(element_id);

        info!(
            element_id = %element_id,
            container_id = %container_id,
            image = %task.image,
            "Workload running"
        );
        Ok(())
    }

    /// Stop and remove the workload's container, tolerating its absence.
    /// With `drop_entry` the status entry is cleared as well.
    async fn teardown(&self, element_id: &str, drop_entry: bool) -> Result<(), RuntimeError> {
        let container_id = self.status.get(element_id).and_then(|s| s.container_id);

        let Some(container_id) = container_id else {
            // Nothing deployed. Removal of an absent workload is success.
            if drop_entry && self.status.remove(element_id) {
                debug!(element_id = %element_id, "Cleared status for undeployed workload");
            }
            return Ok(());
        };

        match self
            .runtime
            .stop_container(&container_id, self.config.stop_timeout)
            .await
        {
            Ok(()) => self.status.mark_stopped(element_id),
            // Already gone; proceed to removal for cleanup.
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.runtime.remove_container(&container_id).await?;

        if drop_entry {
            self.status.remove(element_id);
            info!(element_id = %element_id, container_id = %container_id, "Workload removed");
        }
        Ok(())
    }
}
