//! Mock PodClient for unit testing
//!
//! Records every write and can be told to reject writes for particular pods,
//! without requiring a running API server.

use crate::error::ClientError;
use crate::pod_trait::PodClient;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mock PodClient for testing
///
/// Accepted writes are stored with a bumped resource version, the way the
/// API server would return them.
#[derive(Clone, Default)]
pub struct MockPodClient {
    updates: Arc<Mutex<Vec<Pod>>>,
    stored: Arc<Mutex<HashMap<String, Pod>>>,
    failures: Arc<Mutex<HashMap<String, String>>>,
}

fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

impl MockPodClient {
    /// Create a new mock client
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write to `namespace/name` with `reason` (for test setup)
    pub fn fail_updates_for(&self, namespace: &str, name: &str, reason: impl Into<String>) {
        self.failures
            .lock()
            .unwrap()
            .insert(format!("{namespace}/{name}"), reason.into());
    }

    /// Accept writes to `namespace/name` again
    pub fn clear_failure(&self, namespace: &str, name: &str) {
        self.failures
            .lock()
            .unwrap()
            .remove(&format!("{namespace}/{name}"));
    }

    /// Every write attempted so far, including rejected ones, in call order
    pub fn updates(&self) -> Vec<Pod> {
        self.updates.lock().unwrap().clone()
    }

    /// Number of writes attempted so far
    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    /// Last accepted state of `namespace/name`
    pub fn stored(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.stored
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }
}

#[async_trait::async_trait]
impl PodClient for MockPodClient {
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, ClientError> {
        let key = pod_key(pod);
        self.updates.lock().unwrap().push(pod.clone());

        if let Some(reason) = self.failures.lock().unwrap().get(&key) {
            return Err(ClientError::Api(reason.clone()));
        }

        let mut persisted = pod.clone();
        let version = persisted
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        persisted.metadata.resource_version = Some((version + 1).to_string());

        self.stored.lock().unwrap().insert(key, persisted.clone());
        Ok(persisted)
    }
}
