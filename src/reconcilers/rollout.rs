//! Rollout confirmation after an enforcement update

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::cluster::ClusterApi;
use crate::config::RolloutSettings;
use crate::{Error, Result};

/// Replica count the Deployment asks for (the API server defaults it to 1)
pub fn declared_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// Whether every status counter has caught up with `declared`
///
/// With a `generation`, the status must also have observed at least that
/// generation.
pub fn is_rolled_out(deployment: &Deployment, declared: i32, generation: Option<i64>) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    if let Some(generation) = generation {
        if status.observed_generation.map_or(true, |observed| observed < generation) {
            return false;
        }
    }

    [
        status.available_replicas,
        status.ready_replicas,
        status.updated_replicas,
        status.replicas,
    ]
    .iter()
    .all(|counter| counter.unwrap_or(0) == declared)
}

/// Poll `updated` until its rollout completes
///
/// Returns immediately for Deployments scaled to zero. A timeout does not undo
/// the update that was already submitted.
pub async fn await_rollout(
    cluster: &dyn ClusterApi,
    updated: &Deployment,
    settings: &RolloutSettings,
    shutdown: &CancellationToken,
) -> Result<()> {
    let declared = declared_replicas(updated);
    if declared == 0 {
        return Ok(());
    }

    let namespace = updated.namespace().unwrap_or_default();
    let name = updated.name_any();
    let generation = updated.metadata.generation;

    for attempt in 1..=settings.attempts {
        tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(Error::Cancelled(format!(
                    "rollout wait for {}/{}",
                    namespace, name
                )));
            }
            _ = tokio::time::sleep(settings.interval) => {}
        }

        let current = cluster
            .get_deployment(&namespace, &name)
            .await?
            .ok_or_else(|| {
                Error::KubeError(format!(
                    "Deployment {}/{} disappeared during rollout",
                    namespace, name
                ))
            })?;

        if is_rolled_out(&current, declared, generation) {
            debug!(namespace = %namespace, name = %name, attempt, "Rollout complete");
            return Ok(());
        }

        debug!(namespace = %namespace, name = %name, attempt, "Rollout in progress");
    }

    Err(Error::RolloutTimeout {
        namespace,
        name,
        attempts: settings.attempts,
    })
}
