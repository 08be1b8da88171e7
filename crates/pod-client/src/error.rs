//! Pod client errors

use thiserror::Error;

/// Errors that can occur when persisting a pod
#[derive(Debug, Error)]
pub enum ClientError {
    /// Kubernetes API or transport error (includes write conflicts)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A write rejected by a test double emulating an API refusal.
    ///
    /// `KubePodClient` reports real refusals through [`ClientError::Kube`].
    #[cfg(any(test, feature = "test-util"))]
    #[error("Kubernetes API error: {0}")]
    Api(String),

    /// The pod lacks metadata needed to address it
    #[error("Pod is missing {0}")]
    MissingMetadata(&'static str),
}
