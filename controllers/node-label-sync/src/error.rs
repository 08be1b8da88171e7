//! Controller-specific error types.
//!
//! `LabelerError` covers the propagation engine; `ControllerError` covers the
//! queue workers, the watch streams and process bootstrap.

use pod_client::ClientError;
use thiserror::Error;

/// Errors returned by a single label reconciliation.
///
/// `NotScheduled` and `NodeUnknown` are expected while pods are being
/// scheduled or before a node's first watch event arrives; they are retried
/// like any other failure.
#[derive(Debug, Error)]
pub enum LabelerError {
    /// Pod has no node assigned yet
    #[error("pod `{pod}` isn't scheduled to a node yet, therefore can't label it")]
    NotScheduled { pod: String },

    /// Pod's node has not been observed yet, or was deleted
    #[error("pod `{pod}` couldn't be labeled since node `{node}` is not known (yet)")]
    NodeUnknown { pod: String, node: String },

    /// Writing the labeled pod failed (includes write conflicts)
    #[error("couldn't update pod `{pod}`: {source}")]
    Update {
        pod: String,
        #[source]
        source: ClientError,
    },
}

/// Errors that can occur in the Node Label Sync Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubernetes client configuration could not be inferred
    #[error("Kubernetes configuration error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Queued key cannot be split into namespace and name
    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    /// Watch cache never completed its initial listing
    #[error("{kind} cache failed to sync")]
    CacheSync { kind: String },

    /// Reconciling one key failed
    #[error("couldn't sync {kind} `{key}`, see: {source}")]
    Sync {
        kind: String,
        key: String,
        #[source]
        source: LabelerError,
    },

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// A long-running task exited while the controller was still running
    #[error("{0} stopped unexpectedly")]
    Stopped(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Probe/metrics server error
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}
