//! Kubernetes-backed pod client

use crate::error::ClientError;
use crate::pod_trait::PodClient;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

/// Pod client talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    /// Create a new pod client from a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PodClient for KubePodClient {
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, ClientError> {
        let namespace = pod
            .metadata
            .namespace
            .as_deref()
            .ok_or(ClientError::MissingMetadata("namespace"))?;
        let name = pod
            .metadata
            .name
            .as_deref()
            .ok_or(ClientError::MissingMetadata("name"))?;

        debug!("Replacing pod {}/{}", namespace, name);

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let persisted = api.replace(name, &PostParams::default(), pod).await?;
        Ok(persisted)
    }
}
