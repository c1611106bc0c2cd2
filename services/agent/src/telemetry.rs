//! Host telemetry snapshots produced outside the core.
//!
//! The hardware/USB probing and threshold checks live in a separate
//! collaborator; the agent only stores the latest DTOs it produces and
//! exposes them, read-only, to status reporting.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Hardware inventory strings reported by the telemetry collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceManagerStatus {
    pub hw_info: String,
    pub usb_info: String,
}

/// Host resource consumption with threshold-violation flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConsumptionManagerStatus {
    /// Memory in use, bytes.
    pub memory_usage: u64,
    /// Disk in use, bytes.
    pub disk_usage: u64,
    /// CPU usage in percent.
    pub cpu_usage: f64,
    pub memory_violation: bool,
    pub disk_violation: bool,
    pub cpu_violation: bool,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    resources: Option<ResourceManagerStatus>,
    consumption: Option<ResourceConsumptionManagerStatus>,
}

/// Latest telemetry DTOs, written by the external producer.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    inner: RwLock<Snapshot>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_resources(&self, status: ResourceManagerStatus) {
        let mut inner = self.inner.write().expect("telemetry store lock poisoned");
        inner.resources = Some(status);
    }

    pub fn set_consumption(&self, status: ResourceConsumptionManagerStatus) {
        let mut inner = self.inner.write().expect("telemetry store lock poisoned");
        inner.consumption = Some(status);
    }

    pub fn resources(&self) -> Option<ResourceManagerStatus> {
        self.inner
            .read()
            .expect("telemetry store lock poisoned")
            .resources
            .clone()
    }

    pub fn consumption(&self) -> Option<ResourceConsumptionManagerStatus> {
        self.inner
            .read()
            .expect("telemetry store lock poisoned")
            .consumption
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_starts_empty() {
        let store = TelemetryStore::new();
        assert!(store.resources().is_none());
        assert!(store.consumption().is_none());
    }

    #[test]
    fn test_latest_write_wins() {
        let store = TelemetryStore::new();
        store.set_consumption(ResourceConsumptionManagerStatus {
            cpu_usage: 20.0,
            ..Default::default()
        });
        store.set_consumption(ResourceConsumptionManagerStatus {
            cpu_usage: 85.0,
            cpu_violation: true,
            ..Default::default()
        });

        let latest = store.consumption().unwrap();
        assert_eq!(latest.cpu_usage, 85.0);
        assert!(latest.cpu_violation);
    }

    #[test]
    fn test_consumption_serializes_violation_flags() {
        let status = ResourceConsumptionManagerStatus {
            memory_usage: 512 * 1024 * 1024,
            disk_usage: 0,
            cpu_usage: 91.5,
            memory_violation: false,
            disk_violation: false,
            cpu_violation: true,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"cpu_violation\":true"));
        assert!(json.contains("\"memory_violation\":false"));
    }
}
