//! Desired-state mutations and registry credentials.
//!
//! A [`ContainerTask`] describes one mutation the Controller wants applied
//! to the local runtime: deploy a workload, replace it, or tear it down.
//! Tasks are produced by the Controller-sync collaborator when a
//! desired/actual diff is detected and consumed by the reconciler.
//!
//! Task identity is the target workload: two tasks are equal iff they name
//! the same element id, regardless of action or spec detail. The task queue
//! relies on this as its dedup key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Action requested for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Add,
    Update,
    Remove,
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
        };
        write!(f, "{s}")
    }
}

/// One host/container port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port exposed on the host.
    pub outside: u16,

    /// Port inside the container.
    pub inside: u16,
}

/// One host/container volume pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Reference to the registry credentials a task's image should be pulled
/// with. Resolved against the [`RegistryStore`] before the pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRef {
    pub url: String,
    pub user_email: String,
}

/// One desired mutation for one workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerTask {
    pub action: TaskAction,

    /// Target workload id. Task identity.
    pub element_id: String,

    /// Image reference to deploy (ignored for `Remove`).
    pub image: String,

    #[serde(default)]
    pub ports: Vec<PortMapping>,

    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub registry: Option<RegistryRef>,
}

impl ContainerTask {
    /// Shorthand for a removal task, which carries no spec.
    pub fn remove(element_id: impl Into<String>) -> Self {
        Self {
            action: TaskAction::Remove,
            element_id: element_id.into(),
            image: String::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            env: BTreeMap::new(),
            registry: None,
        }
    }

    /// Build the runtime-facing container spec for this task.
    pub fn to_spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: self.element_id.clone(),
            image: self.image.clone(),
            ports: self.ports.clone(),
            volumes: self.volumes.clone(),
            env: self.env.clone(),
        }
    }
}

// Identity is the target workload only. The queue depends on this when
// deduplicating rapid re-diffs for the same element.
impl PartialEq for ContainerTask {
    fn eq(&self, other: &Self) -> bool {
        self.element_id == other.element_id
    }
}

impl Eq for ContainerTask {}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name; the runtime names containers after the workload.
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMapping>,
    pub env: BTreeMap<String, String>,
}

/// Image-pull credentials for one registry account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub url: String,
    pub secure: bool,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub requires_certificate: bool,
    pub username: String,
    pub password: String,
    pub user_email: String,
}

// Keyed by (url, user_email), case-insensitive: the Controller is not
// consistent about credential casing across provisioning paths.
impl PartialEq for Registry {
    fn eq(&self, other: &Self) -> bool {
        self.url.eq_ignore_ascii_case(&other.url)
            && self.user_email.eq_ignore_ascii_case(&other.user_email)
    }
}

impl Eq for Registry {}

impl Registry {
    fn matches(&self, url: &str, user_email: &str) -> bool {
        self.url.eq_ignore_ascii_case(url) && self.user_email.eq_ignore_ascii_case(user_email)
    }
}

/// In-memory set of registry credentials, updated by the Controller-sync
/// collaborator and read by the reconciler before each image pull.
#[derive(Debug, Default)]
pub struct RegistryStore {
    entries: std::sync::RwLock<Vec<Registry>>,
}

impl RegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert credentials, replacing any entry with the same key.
    pub fn upsert(&self, registry: Registry) {
        let mut entries = self.entries.write().expect("registry store lock poisoned");
        if let Some(existing) = entries.iter_mut().find(|e| **e == registry) {
            *existing = registry;
        } else {
            entries.push(registry);
        }
    }

    /// Look up credentials by case-insensitive (url, user_email).
    pub fn find(&self, url: &str, user_email: &str) -> Option<Registry> {
        let entries = self.entries.read().expect("registry store lock poisoned");
        entries.iter().find(|e| e.matches(url, user_email)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(url: &str, email: &str, password: &str) -> Registry {
        Registry {
            url: url.to_string(),
            secure: true,
            certificate: None,
            requires_certificate: false,
            username: "agent".to_string(),
            password: password.to_string(),
            user_email: email.to_string(),
        }
    }

    #[test]
    fn test_task_equality_is_element_id_only() {
        let add = ContainerTask {
            action: TaskAction::Add,
            element_id: "svc1".to_string(),
            image: "nginx:latest".to_string(),
            ports: vec![PortMapping {
                outside: 8080,
                inside: 80,
            }],
            volumes: vec![],
            env: BTreeMap::new(),
            registry: None,
        };
        let remove = ContainerTask::remove("svc1");

        assert_eq!(add, remove);
        assert_ne!(add, ContainerTask::remove("svc2"));
    }

    #[test]
    fn test_spec_carries_element_id_as_name() {
        let mut task = ContainerTask::remove("svc1");
        task.action = TaskAction::Add;
        task.image = "nginx:latest".to_string();

        let spec = task.to_spec();
        assert_eq!(spec.name, "svc1");
        assert_eq!(spec.image, "nginx:latest");
    }

    #[test]
    fn test_registry_find_is_case_insensitive() {
        let store = RegistryStore::new();
        store.upsert(registry("https://Registry.Example.COM", "Ops@Example.com", "s3cret"));

        let found = store
            .find("https://registry.example.com", "ops@example.com")
            .expect("registry should match case-insensitively");
        assert_eq!(found.password, "s3cret");

        assert!(store.find("https://registry.example.com", "other@example.com").is_none());
    }

    #[test]
    fn test_registry_upsert_replaces_equal_entry() {
        let store = RegistryStore::new();
        store.upsert(registry("https://r.example.com", "ops@example.com", "old"));
        store.upsert(registry("https://R.EXAMPLE.COM", "OPS@example.com", "new"));

        assert_eq!(store.len(), 1);
        let found = store.find("https://r.example.com", "ops@example.com").unwrap();
        assert_eq!(found.password, "new");
    }
}
