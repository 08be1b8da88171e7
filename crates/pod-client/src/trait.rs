//! PodClient trait for mocking
//!
//! The concrete [`KubePodClient`](crate::KubePodClient) implements this trait,
//! and tests use [`MockPodClient`](crate::MockPodClient) (feature `test-util`).

use crate::error::ClientError;
use k8s_openapi::api::core::v1::Pod;

/// Trait for the pod write operation
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait PodClient: Send + Sync {
    /// Persists `pod` in its namespace, replacing the stored object.
    ///
    /// Returns the object as stored by the API server, carrying its new
    /// resource version. A conflict with a concurrent modification is
    /// reported as an ordinary error.
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, ClientError>;
}
