//! Controller wiring: observation translation, dispatch and worker pools

pub mod deployment_controller;
pub mod dispatcher;
pub mod informer;

use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::adapters::cluster::ClusterApi;
use crate::config::Settings;

/// Shared context for reconcilers
pub struct Context {
    /// Cluster API access
    pub cluster: Arc<dyn ClusterApi>,
    /// Validated configuration
    pub settings: Arc<Settings>,
    /// Bounds concurrent enforcement updates
    pub update_permits: Semaphore,
    /// Cancelled when the operator shuts down
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a new context
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        settings: Settings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            update_permits: Semaphore::new(settings.update_permits),
            settings: Arc::new(settings),
            shutdown,
        })
    }
}

/// A Deployment observation delivered by the informer
#[derive(Clone, Debug, PartialEq)]
pub enum WorkloadEvent {
    Added(Deployment),
    Updated { old: Deployment, new: Deployment },
    Deleted(Deployment),
}
