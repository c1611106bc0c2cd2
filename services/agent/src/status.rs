//! Per-workload lifecycle and resource-usage snapshots.
//!
//! The store is shared by three parties with a strict write partition:
//! the reconciler owns the lifecycle fields (`state`, `start_time`,
//! `container_id`, `last_error`, entry creation/removal), the stats
//! collector owns the usage fields (`cpu_usage`, `memory_usage`), and
//! everyone else gets read-only snapshots. The partition means the two
//! writers never race on the same field even though they share the map.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementState {
    /// Image pull and container creation in progress.
    Building,
    /// Terminal config or runtime rejection; waits for a fresh add.
    FailedVerification,
    /// Container created, start issued.
    Starting,
    Running,
    Stopped,
}

impl ElementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::FailedVerification => "failed_verification",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ElementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle and usage snapshot of one workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementStatus {
    pub state: ElementState,

    /// Set when the workload entered `Running`; cleared on stop.
    pub start_time: Option<DateTime<Utc>>,

    /// Runtime handle of the deployed container, recorded at create time.
    pub container_id: Option<String>,

    /// Cause of the last `FailedVerification`, for upstream reporting.
    pub last_error: Option<String>,

    /// CPU usage in percent, last sample wins.
    pub cpu_usage: f64,

    /// Memory usage in bytes, last sample wins.
    pub memory_usage: u64,
}

impl ElementStatus {
    fn new(state: ElementState) -> Self {
        Self {
            state,
            start_time: None,
            container_id: None,
            last_error: None,
            cpu_usage: 0.0,
            memory_usage: 0,
        }
    }

    /// Time spent running. `Some` only while the workload is `Running`.
    pub fn operating_duration(&self) -> Option<chrono::Duration> {
        if self.state != ElementState::Running {
            return None;
        }
        self.start_time.map(|started| Utc::now() - started)
    }
}

/// Shared element-id → [`ElementStatus`] map.
#[derive(Debug, Default)]
pub struct StatusStore {
    inner: RwLock<HashMap<String, ElementStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- lifecycle writers (reconciler only) ---

    /// Enter `Building`, creating the entry on first deploy. Clears the
    /// residue of any previous life of this workload.
    pub fn mark_building(&self, element_id: &str) {
        let mut inner = self.inner.write().expect("status store lock poisoned");
        let status = inner
            .entry(element_id.to_string())
            .or_insert_with(|| ElementStatus::new(ElementState::Building));
        status.state = ElementState::Building;
        status.start_time = None;
        status.container_id = None;
        status.last_error = None;
    }

    /// Enter `Starting` and record the container the runtime handed back.
    pub fn mark_starting(&self, element_id: &str, container_id: &str) {
        let mut inner = self.inner.write().expect("status store lock poisoned");
        if let Some(status) = inner.get_mut(element_id) {
            status.state = ElementState::Starting;
            status.container_id = Some(container_id.to_string());
        }
    }

    /// Enter `Running` with `start_time` = now.
    pub fn mark_running(&self, element_id: &str) {
        let mut inner = self.inner.write().expect("status store lock poisoned");
        if let Some(status) = inner.get_mut(element_id) {
            status.state = ElementState::Running;
            status.start_time = Some(Utc::now());
            status.last_error = None;
        }
    }

    pub fn mark_stopped(&self, element_id: &str) {
        let mut inner = self.inner.write().expect("status store lock poisoned");
        if let Some(status) = inner.get_mut(element_id) {
            status.state = ElementState::Stopped;
            status.start_time = None;
        }
    }

    /// Enter `FailedVerification` with the cause, creating the entry if the
    /// workload never got far enough to have one.
    pub fn mark_failed(&self, element_id: &str, error: &str) {
        let mut inner = self.inner.write().expect("status store lock poisoned");
        let status = inner
            .entry(element_id.to_string())
            .or_insert_with(|| ElementStatus::new(ElementState::FailedVerification));
        status.state = ElementState::FailedVerification;
        status.start_time = None;
        status.last_error = Some(error.to_string());
    }

    /// Drop the entry after a successful removal.
    pub fn remove(&self, element_id: &str) -> bool {
        let mut inner = self.inner.write().expect("status store lock poisoned");
        inner.remove(element_id).is_some()
    }

    // --- usage writers (stats collector only) ---

    pub fn set_usage(&self, element_id: &str, cpu_usage: f64, memory_usage: u64) {
        let mut inner = self.inner.write().expect("status store lock poisoned");
        if let Some(status) = inner.get_mut(element_id) {
            status.cpu_usage = cpu_usage;
            status.memory_usage = memory_usage;
        }
    }

    pub fn zero_usage(&self, element_id: &str) {
        self.set_usage(element_id, 0.0, 0);
    }

    // --- read-only accessors ---

    pub fn get(&self, element_id: &str) -> Option<ElementStatus> {
        let inner = self.inner.read().expect("status store lock poisoned");
        inner.get(element_id).cloned()
    }

    pub fn contains(&self, element_id: &str) -> bool {
        let inner = self.inner.read().expect("status store lock poisoned");
        inner.contains_key(element_id)
    }

    /// Snapshot of all entries, sorted by element id for stable output.
    pub fn snapshot(&self) -> Vec<(String, ElementStatus)> {
        let inner = self.inner.read().expect("status store lock poisoned");
        let mut entries: Vec<_> = inner
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
    }

    /// `(element_id, container_id)` for every workload currently `Running`.
    pub fn running_containers(&self) -> Vec<(String, String)> {
        let inner = self.inner.read().expect("status store lock poisoned");
        inner
            .iter()
            .filter(|(_, status)| status.state == ElementState::Running)
            .filter_map(|(id, status)| {
                status
                    .container_id
                    .as_ref()
                    .map(|container| (id.clone(), container.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("status store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_transitions() {
        let store = StatusStore::new();

        store.mark_building("svc1");
        assert_eq!(store.get("svc1").unwrap().state, ElementState::Building);

        store.mark_starting("svc1", "ctr_1");
        let status = store.get("svc1").unwrap();
        assert_eq!(status.state, ElementState::Starting);
        assert_eq!(status.container_id.as_deref(), Some("ctr_1"));

        store.mark_running("svc1");
        let status = store.get("svc1").unwrap();
        assert_eq!(status.state, ElementState::Running);
        assert!(status.start_time.is_some());
    }

    #[test]
    fn test_operating_duration_only_while_running() {
        let store = StatusStore::new();
        store.mark_building("svc1");
        store.mark_starting("svc1", "ctr_1");
        assert!(store.get("svc1").unwrap().operating_duration().is_none());

        store.mark_running("svc1");
        let duration = store.get("svc1").unwrap().operating_duration();
        assert!(duration.is_some());
        assert!(duration.unwrap() >= chrono::Duration::zero());

        store.mark_stopped("svc1");
        assert!(store.get("svc1").unwrap().operating_duration().is_none());
    }

    #[test]
    fn test_rebuild_clears_failure_residue() {
        let store = StatusStore::new();
        store.mark_failed("svc1", "registry auth rejected");
        let status = store.get("svc1").unwrap();
        assert_eq!(status.state, ElementState::FailedVerification);
        assert!(status.last_error.is_some());

        store.mark_building("svc1");
        let status = store.get("svc1").unwrap();
        assert_eq!(status.state, ElementState::Building);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_usage_survives_lifecycle_writes() {
        let store = StatusStore::new();
        store.mark_building("svc1");
        store.mark_starting("svc1", "ctr_1");
        store.mark_running("svc1");

        store.set_usage("svc1", 12.5, 64 * 1024 * 1024);
        let status = store.get("svc1").unwrap();
        assert_eq!(status.cpu_usage, 12.5);
        assert_eq!(status.memory_usage, 64 * 1024 * 1024);

        store.zero_usage("svc1");
        let status = store.get("svc1").unwrap();
        assert_eq!(status.cpu_usage, 0.0);
        assert_eq!(status.memory_usage, 0);
    }

    #[test]
    fn test_running_containers_filters_state() {
        let store = StatusStore::new();
        store.mark_building("building");
        store.mark_building("running");
        store.mark_starting("running", "ctr_r");
        store.mark_running("running");
        store.mark_failed("failed", "boom");

        let running = store.running_containers();
        assert_eq!(running, vec![("running".to_string(), "ctr_r".to_string())]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = StatusStore::new();
        store.mark_building("svc1");

        assert!(store.remove("svc1"));
        assert!(!store.remove("svc1"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_sorted_by_id() {
        let store = StatusStore::new();
        for id in ["zeta", "alpha", "mid"] {
            store.mark_building(id);
        }

        let ids: Vec<_> = store.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }
}
