//! Cluster API access used by the reconcilers
//!
//! Reconcilers talk to the API server only through [`ClusterApi`] so that
//! their decisions can be exercised against mocks and in-memory fakes.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::debug;

use crate::crd::HorizontalPodCronscaler;
use crate::{Error, Result};

/// Namespaced operations on Deployments and cronscalers
///
/// Every call either succeeds or fails as a whole; there are no partial
/// results. Deleting an object that does not exist succeeds, and creating a
/// cronscaler that already exists succeeds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a Deployment, `None` when it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Create a Deployment in the namespace recorded in its metadata
    async fn create_deployment(
        &self,
        deployment: &Deployment,
        field_manager: &str,
    ) -> Result<Deployment>;

    /// Replace a Deployment in the namespace recorded in its metadata
    async fn update_deployment(
        &self,
        deployment: &Deployment,
        field_manager: &str,
    ) -> Result<Deployment>;

    /// Delete a Deployment
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a cronscaler in the namespace recorded in its metadata
    async fn create_cronscaler(&self, cronscaler: &HorizontalPodCronscaler) -> Result<()>;

    /// Delete a cronscaler
    async fn delete_cronscaler(&self, namespace: &str, name: &str) -> Result<()>;

    /// List cronscalers in every namespace matching a label selector
    async fn list_cronscalers(&self, label_selector: &str) -> Result<Vec<HorizontalPodCronscaler>>;
}

/// [`ClusterApi`] backed by a kube client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cronscalers(&self, namespace: &str) -> Api<HorizontalPodCronscaler> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn has_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

/// Namespace of an object about to be written
fn target_namespace<K: Resource>(object: &K) -> Result<String> {
    object.namespace().ok_or_else(|| {
        Error::ValidationError(format!("{} has no namespace", object.name_any()))
    })
}

fn post_params(field_manager: &str) -> PostParams {
    PostParams {
        field_manager: Some(field_manager.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.deployments(namespace)
            .get_opt(name)
            .await
            .map_err(|e| {
                Error::KubeError(format!(
                    "Failed to get Deployment {}/{}: {}",
                    namespace, name, e
                ))
            })
    }

    async fn create_deployment(
        &self,
        deployment: &Deployment,
        field_manager: &str,
    ) -> Result<Deployment> {
        let namespace = target_namespace(deployment)?;
        self.deployments(&namespace)
            .create(&post_params(field_manager), deployment)
            .await
            .map_err(|e| {
                Error::KubeError(format!(
                    "Failed to create Deployment {}/{}: {}",
                    namespace,
                    deployment.name_any(),
                    e
                ))
            })
    }

    async fn update_deployment(
        &self,
        deployment: &Deployment,
        field_manager: &str,
    ) -> Result<Deployment> {
        let namespace = target_namespace(deployment)?;
        let name = deployment.name_any();
        self.deployments(&namespace)
            .replace(&name, &post_params(field_manager), deployment)
            .await
            .map_err(|e| {
                Error::KubeError(format!(
                    "Failed to update Deployment {}/{}: {}",
                    namespace, name, e
                ))
            })
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if has_status(&e, 404) => {
                debug!(namespace, name, "Deployment already absent");
                Ok(())
            }
            Err(e) => Err(Error::KubeError(format!(
                "Failed to delete Deployment {}/{}: {}",
                namespace, name, e
            ))),
        }
    }

    async fn create_cronscaler(&self, cronscaler: &HorizontalPodCronscaler) -> Result<()> {
        let namespace = target_namespace(cronscaler)?;
        let name = cronscaler.name_any();
        match self
            .cronscalers(&namespace)
            .create(&PostParams::default(), cronscaler)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if has_status(&e, 409) => {
                debug!(namespace = %namespace, name = %name, "HorizontalPodCronscaler already exists");
                Ok(())
            }
            Err(e) => Err(Error::KubeError(format!(
                "Failed to create HorizontalPodCronscaler {}/{}: {}",
                namespace, name, e
            ))),
        }
    }

    async fn delete_cronscaler(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .cronscalers(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if has_status(&e, 404) => {
                debug!(namespace, name, "HorizontalPodCronscaler already absent");
                Ok(())
            }
            Err(e) => Err(Error::KubeError(format!(
                "Failed to delete HorizontalPodCronscaler {}/{}: {}",
                namespace, name, e
            ))),
        }
    }

    async fn list_cronscalers(&self, label_selector: &str) -> Result<Vec<HorizontalPodCronscaler>> {
        let cronscalers: Api<HorizontalPodCronscaler> = Api::all(self.client.clone());
        cronscalers
            .list(&ListParams::default().labels(label_selector))
            .await
            .map(|list| list.items)
            .map_err(|e| Error::KubeError(format!("Failed to list HorizontalPodCronscalers: {}", e)))
    }
}
