//! Label propagation engine.
//!
//! The [`Labeler`] mirrors every known pod and node and copies the configured
//! label keys from each node onto the pods scheduled on it. Both reconcile
//! entry points hold one exclusive lock for their whole duration, including
//! the outgoing pod write, so no reconciliation sees a half-updated mirror.

use crate::error::LabelerError;
use crate::metrics::{Metrics, Outcome};
use crate::watcher::{Observed, Reconcile, key_for};
use k8s_openapi::api::core::v1::{Node, Pod};
use pod_client::PodClient;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Mirrors {
    /// Pods by `namespace/name`
    pods: HashMap<String, Pod>,
    /// Nodes by name
    nodes: HashMap<String, Node>,
}

/// Shared propagation state, reconciled by the pod and node controllers.
pub struct Labeler {
    labels: Vec<String>,
    mirrors: Mutex<Mirrors>,
    client: Box<dyn PodClient>,
    metrics: Metrics,
}

fn node_name_of(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Computes the pod labels after copying `keys` from `node_labels`.
///
/// Returns `None` when every key present on the node already matches, so
/// no write is needed. Keys absent from the node are skipped and never
/// removed from the pod.
pub fn desired_labels(
    keys: &[String],
    node_labels: Option<&BTreeMap<String, String>>,
    pod_labels: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut desired = pod_labels.cloned().unwrap_or_default();
    let mut dirty = false;

    for key in keys {
        let Some(value) = node_labels.and_then(|labels| labels.get(key)) else {
            continue;
        };
        if desired.get(key) != Some(value) {
            desired.insert(key.clone(), value.clone());
            dirty = true;
        }
    }

    dirty.then_some(desired)
}

impl Labeler {
    pub fn new(labels: Vec<String>, client: Box<dyn PodClient>, metrics: Metrics) -> Self {
        Self {
            labels,
            mirrors: Mutex::new(Mirrors::default()),
            client,
            metrics,
        }
    }

    /// Mirrors `observed` and brings its labels in line with its node.
    pub async fn handle_pod(&self, observed: Observed<Pod>) -> Result<(), LabelerError> {
        let mut mirrors = self.mirrors.lock().await;

        let Some(key) = key_for(observed.object()) else {
            warn!("Ignoring pod without a name");
            return Ok(());
        };
        if observed.is_deleted() {
            debug!("Forgetting deleted pod {}", key);
            mirrors.pods.remove(&key);
        } else {
            mirrors.pods.insert(key.clone(), observed.object().clone());
        }

        self.label_pod(&mut mirrors, &key, observed.object()).await
    }

    /// Mirrors `observed` and relabels every known pod scheduled on it.
    ///
    /// A failing pod does not stop the others from being labeled; the last
    /// failure is returned.
    pub async fn handle_node(&self, observed: Observed<Node>) -> Result<(), LabelerError> {
        let mut mirrors = self.mirrors.lock().await;

        let Some(name) = observed.object().metadata.name.clone() else {
            warn!("Ignoring node without a name");
            return Ok(());
        };
        if observed.is_deleted() {
            debug!("Forgetting deleted node {}", name);
            mirrors.nodes.remove(&name);
        } else {
            mirrors.nodes.insert(name.clone(), observed.object().clone());
        }

        // pods on other nodes can't be affected by this node's labels
        let mut keys: Vec<String> = mirrors
            .pods
            .iter()
            .filter(|(_, pod)| node_name_of(pod) == Some(name.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();

        let mut last_error = None;
        for key in keys {
            let Some(pod) = mirrors.pods.get(&key).cloned() else {
                continue;
            };
            if let Err(e) = self.label_pod(&mut mirrors, &key, &pod).await {
                warn!("Couldn't label pod {} after change of node {}: {}", key, name, e);
                last_error = Some(e);
            }
        }

        last_error.map_or(Ok(()), Err)
    }

    /// Copies the configured node labels onto `pod` and persists it if anything changed.
    ///
    /// The mirror entry is only replaced by the persisted pod after a
    /// successful write, and only while the pod is still mirrored.
    async fn label_pod(&self, mirrors: &mut Mirrors, key: &str, pod: &Pod) -> Result<(), LabelerError> {
        let node_name = node_name_of(pod).ok_or_else(|| LabelerError::NotScheduled { pod: key.to_string() })?;
        let node = mirrors.nodes.get(node_name).ok_or_else(|| LabelerError::NodeUnknown {
            pod: key.to_string(),
            node: node_name.to_string(),
        })?;

        for label in &self.labels {
            let present = node.metadata.labels.as_ref().is_some_and(|l| l.contains_key(label));
            if !present {
                debug!("Node {} has no label {}, not propagating it to pod {}", node_name, label, key);
            }
        }

        let Some(desired) = desired_labels(&self.labels, node.metadata.labels.as_ref(), pod.metadata.labels.as_ref())
        else {
            debug!("Pod {} labels already in sync with node {}", key, node_name);
            return Ok(());
        };

        info!("Syncing labels of pod {} from node {}", key, node_name);
        let mut updated = pod.clone();
        updated.metadata.labels = Some(desired);

        match self.client.replace_pod(&updated).await {
            Ok(persisted) => {
                self.metrics.record_pod_update(Outcome::Success);
                if let Some(entry) = mirrors.pods.get_mut(key) {
                    *entry = persisted;
                }
                Ok(())
            }
            Err(source) => {
                self.metrics.record_pod_update(Outcome::Error);
                Err(LabelerError::Update {
                    pod: key.to_string(),
                    source,
                })
            }
        }
    }

    /// Runs the labeling step for the mirrored copy of `key`.
    #[cfg(test)]
    pub(crate) async fn label_mirrored_pod(&self, key: &str) -> Result<(), LabelerError> {
        let mut mirrors = self.mirrors.lock().await;
        let Some(pod) = mirrors.pods.get(key).cloned() else {
            return Ok(());
        };
        self.label_pod(&mut mirrors, key, &pod).await
    }

    #[cfg(test)]
    pub(crate) async fn mirrored_pod(&self, key: &str) -> Option<Pod> {
        self.mirrors.lock().await.pods.get(key).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn mirrored_node(&self, name: &str) -> Option<Node> {
        self.mirrors.lock().await.nodes.get(name).cloned()
    }
}

#[async_trait::async_trait]
impl Reconcile<Pod> for Labeler {
    async fn reconcile(&self, observed: Observed<Pod>) -> Result<(), LabelerError> {
        self.handle_pod(observed).await
    }
}

#[async_trait::async_trait]
impl Reconcile<Node> for Labeler {
    async fn reconcile(&self, observed: Observed<Node>) -> Result<(), LabelerError> {
        self.handle_node(observed).await
    }
}
