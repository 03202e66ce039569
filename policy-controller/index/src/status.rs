//! The user-visible policy realization surface.
//!
//! Statuses are published by the reconciler through a [`Writer`] and read
//! by the aggregated API's list/watch layer through a shared [`Reader`].

use ahash::AHashMap as HashMap;
use anyhow::Result;
use cloudnet_policy_controller_core::NamespacedName;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Per-VM policy realization status: policy name to status string.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NetworkPolicyStatus {
    pub resource: NamespacedName,
    pub statuses: HashMap<String, String>,
}

impl NetworkPolicyStatus {
    pub fn new(resource: NamespacedName, statuses: HashMap<String, String>) -> Self {
        Self { resource, statuses }
    }
}

type Shared = Arc<RwLock<HashMap<String, NetworkPolicyStatus>>>;

/// Publishes status updates. Held by the reconciler.
#[derive(Clone, Debug, Default)]
pub struct Writer(Shared);

/// Supports lookups in the shared status map.
#[derive(Clone, Debug, Default)]
pub struct Reader(Shared);

pub fn pair() -> (Writer, Reader) {
    let shared = Shared::default();
    (Writer(shared.clone()), Reader(shared))
}

// === impl Writer ===

impl Writer {
    pub fn get(&self, resource: &NamespacedName) -> Option<NetworkPolicyStatus> {
        self.0.read().get(&resource.to_string()).cloned()
    }

    pub fn set(&mut self, status: NetworkPolicyStatus) -> Result<()> {
        self.0
            .write()
            .insert(status.resource.to_string(), status);
        Ok(())
    }

    pub fn remove(&mut self, resource: &NamespacedName) -> Result<()> {
        self.0.write().remove(&resource.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

// === impl Reader ===

impl Reader {
    pub fn get(&self, namespace: &str, name: &str) -> Option<NetworkPolicyStatus> {
        self.0
            .read()
            .get(&NamespacedName::new(namespace, name).to_string())
            .cloned()
    }

    pub fn list(&self) -> Vec<NetworkPolicyStatus> {
        let mut statuses = self.0.read().values().cloned().collect::<Vec<_>>();
        statuses.sort_by(|a, b| a.resource.cmp(&b.resource));
        statuses
    }
}
