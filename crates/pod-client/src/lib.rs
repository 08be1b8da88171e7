//! Pod write client
//!
//! The only API write the label sync controller performs is persisting a pod
//! whose labels changed. This crate narrows the Kubernetes client down to
//! that single operation so the propagation engine can be tested without a
//! cluster.
//!
//! # Example
//!
//! ```no_run
//! use pod_client::{KubePodClient, PodClient};
//! use k8s_openapi::api::core::v1::Pod;
//!
//! # async fn example(pod: Pod) -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubePodClient::new(kube::Client::try_default().await?);
//! let persisted = client.replace_pod(&pod).await?;
//! println!("new resource version: {:?}", persisted.metadata.resource_version);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod pod_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubePodClient;
pub use error::ClientError;
pub use pod_trait::PodClient;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockPodClient;
