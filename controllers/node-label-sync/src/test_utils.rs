//! Test utilities for unit testing the labeler and watchers
//!
//! This module provides builders for pods, nodes and a labeler backed by the mock pod client.

#[cfg(test)]
use crate::labeler::Labeler;
#[cfg(test)]
use crate::metrics::Metrics;
#[cfg(test)]
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec};
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use pod_client::MockPodClient;
#[cfg(test)]
use std::collections::BTreeMap;

/// Helper to build a label map from pairs
#[cfg(test)]
pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Helper to create a test Pod, optionally scheduled to `node`
#[cfg(test)]
pub fn test_pod(namespace: &str, name: &str, node: Option<&str>, pod_labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            labels: (!pod_labels.is_empty()).then(|| labels(pod_labels)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            ..Default::default()
        }),
        status: None,
    }
}

/// Helper to create a test Node
#[cfg(test)]
pub fn test_node(name: &str, node_labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: (!node_labels.is_empty()).then(|| labels(node_labels)),
            ..Default::default()
        },
        spec: None,
        status: None,
    }
}

/// Helper to create a Labeler syncing `keys`, with a handle on its mock client
#[cfg(test)]
pub fn test_labeler(keys: &[&str]) -> (Labeler, MockPodClient) {
    let client = MockPodClient::new();
    let labeler = Labeler::new(
        keys.iter().map(|k| (*k).to_string()).collect(),
        Box::new(client.clone()),
        Metrics::new().unwrap(),
    );
    (labeler, client)
}

/// Labels of `pod`, empty when it has none
#[cfg(test)]
pub fn labels_of(pod: &Pod) -> BTreeMap<String, String> {
    pod.metadata.labels.clone().unwrap_or_default()
}
