//! Container runtime contract and mock implementation.
//!
//! The [`ContainerRuntime`] trait is the only seam between the agent and
//! the container engine: image pulls, container lifecycle, and usage
//! sampling. Every operation reports failure as a [`RuntimeError`] whose
//! variant carries the transient/permanent classification the retry policy
//! depends on.
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::task::{ContainerSpec, Registry};

/// Runtime handle of a container.
pub type ContainerId = String;

/// One resource-usage sample for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSample {
    /// CPU usage in percent of one core.
    pub cpu_percent: f64,

    /// Resident memory in bytes.
    pub memory_bytes: u64,
}

/// Failures reported by the container engine.
///
/// The retry policy keys entirely off [`RuntimeError::is_transient`]:
/// transient failures keep the task queued with backoff, everything else
/// drops the task and fails the workload's verification.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Operation exceeded its bounded timeout.
    #[error("{op} timed out after {elapsed:?}")]
    Timeout { op: &'static str, elapsed: Duration },

    /// Engine or network unreachable.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// Resource temporarily busy.
    #[error("resource busy: {0}")]
    Busy(String),

    /// Target container or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Image reference the engine refuses to parse or resolve.
    #[error("invalid image reference: {0}")]
    InvalidImage(String),

    /// Port, volume, or env specification rejected by the engine.
    #[error("invalid container spec: {0}")]
    InvalidSpec(String),

    /// Registry rejected the supplied credentials.
    #[error("registry auth rejected: {0}")]
    AuthRejected(String),

    /// Unexpected engine failure.
    #[error("runtime internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable(_) | Self::Busy(_)
        )
    }
}

/// Container engine operations the reconciler and stats collector consume.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image, optionally authenticating against its registry.
    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&Registry>,
    ) -> Result<(), RuntimeError>;

    /// Create a container from the spec and return its runtime handle.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError>;

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Stop a container: graceful for `graceful_timeout`, then killed.
    async fn stop_container(
        &self,
        container_id: &str,
        graceful_timeout: Duration,
    ) -> Result<(), RuntimeError>;

    /// Remove a container. Succeeds if it is already absent.
    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Handles of all currently running containers.
    async fn list_running(&self) -> Result<HashSet<ContainerId>, RuntimeError>;

    /// One usage sample for a container.
    async fn sample_stats(&self, container_id: &str) -> Result<UsageSample, RuntimeError>;
}

// =============================================================================
// Mock runtime
// =============================================================================

/// Operation selector for scripting mock failures and counting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    List,
    Stats,
}

/// One recorded call against the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Pull { image: String, authenticated: bool },
    Create { name: String },
    Start { container_id: String },
    Stop { container_id: String, timeout: Duration },
    Remove { container_id: String },
    List,
    Stats { container_id: String },
}

impl MockCall {
    pub fn op(&self) -> MockOp {
        match self {
            Self::Pull { .. } => MockOp::Pull,
            Self::Create { .. } => MockOp::Create,
            Self::Start { .. } => MockOp::Start,
            Self::Stop { .. } => MockOp::Stop,
            Self::Remove { .. } => MockOp::Remove,
            Self::List => MockOp::List,
            Self::Stats { .. } => MockOp::Stats,
        }
    }
}

#[derive(Debug)]
struct ScriptedFailure {
    error: RuntimeError,
    /// `None` fails forever; `Some(n)` fails the next n calls.
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct MockContainer {
    name: String,
    running: bool,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    containers: HashMap<ContainerId, MockContainer>,
    failures: HashMap<MockOp, ScriptedFailure>,
    sample: UsageSample,
}

/// In-memory [`ContainerRuntime`] for tests and development.
///
/// Records every call for assertions and fails operations on demand,
/// including fail-n-times-then-succeed for exercising the retry policy.
#[derive(Debug, Default)]
pub struct MockRuntime {
    counter: AtomicU64,
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `op` to fail with `error` on every call until cleared.
    pub fn fail(&self, op: MockOp, error: RuntimeError) {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        state.failures.insert(
            op,
            ScriptedFailure {
                error,
                remaining: None,
            },
        );
    }

    /// Script `op` to fail with `error` for the next `times` calls.
    pub fn fail_times(&self, op: MockOp, error: RuntimeError, times: u32) {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        state.failures.insert(
            op,
            ScriptedFailure {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn clear_failure(&self, op: MockOp) {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        state.failures.remove(&op);
    }

    /// Sample returned by `sample_stats` for every container.
    pub fn set_sample(&self, cpu_percent: f64, memory_bytes: u64) {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        state.sample = UsageSample {
            cpu_percent,
            memory_bytes,
        };
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .calls
            .clone()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .calls
            .iter()
            .filter(|c| c.op() == op)
            .count()
    }

    /// Whether a running container with this name exists.
    pub fn is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .containers
            .values()
            .any(|c| c.name == name && c.running)
    }

    pub fn container_count(&self) -> usize {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .containers
            .len()
    }

    /// Drop a container behind the agent's back, as an external `rm -f`
    /// would. For exercising the vanished-container paths.
    pub fn evict_container(&self, container_id: &str) {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        state.containers.remove(container_id);
    }

    fn next_container_id(&self) -> ContainerId {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("ctr_{counter:08x}")
    }

    fn record_and_check(&self, call: MockCall) -> Result<(), RuntimeError> {
        let op = call.op();
        let mut state = self.state.lock().expect("mock state lock poisoned");
        state.calls.push(call);

        let Some(failure) = state.failures.get_mut(&op) else {
            return Ok(());
        };
        match failure.remaining {
            None => Err(failure.error.clone()),
            Some(0) => {
                state.failures.remove(&op);
                Ok(())
            }
            Some(ref mut n) => {
                *n -= 1;
                Err(failure.error.clone())
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&Registry>,
    ) -> Result<(), RuntimeError> {
        self.record_and_check(MockCall::Pull {
            image: image.to_string(),
            authenticated: credentials.is_some(),
        })?;

        debug!(image = %image, "[MOCK] Image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        self.record_and_check(MockCall::Create {
            name: spec.name.clone(),
        })?;

        let mut state = self.state.lock().expect("mock state lock poisoned");
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Internal(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        let container_id = self.next_container_id();
        state.containers.insert(
            container_id.clone(),
            MockContainer {
                name: spec.name.clone(),
                running: false,
            },
        );

        info!(name = %spec.name, container_id = %container_id, "[MOCK] Container created");
        Ok(container_id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.record_and_check(MockCall::Start {
            container_id: container_id.to_string(),
        })?;

        let mut state = self.state.lock().expect("mock state lock poisoned");
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.running = true;

        debug!(container_id = %container_id, "[MOCK] Container started");
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        graceful_timeout: Duration,
    ) -> Result<(), RuntimeError> {
        self.record_and_check(MockCall::Stop {
            container_id: container_id.to_string(),
            timeout: graceful_timeout,
        })?;

        let mut state = self.state.lock().expect("mock state lock poisoned");
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.running = false;

        debug!(container_id = %container_id, "[MOCK] Container stopped");
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.record_and_check(MockCall::Remove {
            container_id: container_id.to_string(),
        })?;

        let mut state = self.state.lock().expect("mock state lock poisoned");
        // Absent is success: removal is idempotent.
        state.containers.remove(container_id);

        debug!(container_id = %container_id, "[MOCK] Container removed");
        Ok(())
    }

    async fn list_running(&self) -> Result<HashSet<ContainerId>, RuntimeError> {
        self.record_and_check(MockCall::List)?;

        let state = self.state.lock().expect("mock state lock poisoned");
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn sample_stats(&self, container_id: &str) -> Result<UsageSample, RuntimeError> {
        self.record_and_check(MockCall::Stats {
            container_id: container_id.to_string(),
        })?;

        let state = self.state.lock().expect("mock state lock poisoned");
        if !state.containers.contains_key(container_id) {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        Ok(state.sample)
    }
}
