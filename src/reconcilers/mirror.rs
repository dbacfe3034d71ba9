//! Shadow Deployment lifecycle
//!
//! The shadow of a mirror-eligible source is created (with its cronscaler)
//! when missing, updated in place when the source changes, and deleted along
//! with its cronscaler when the source is deleted. Once a shadow exists its
//! replica count belongs to the autoscaler, so updates carry the live count
//! forward instead of resetting it.
//!
//! Every sync also (re)creates the cronscaler, so one lost after a failed
//! create comes back on the next observation of the source.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::adapters::cluster::ClusterApi;
use crate::adapters::shadow_builder::{
    build_cronscaler, build_shadow, cronscaler_name, shadow_name,
};
use crate::config::{annotations, labels, MirrorPolicy};
use crate::Result;

/// Field manager recorded when a shadow is created
pub const CREATE_FIELD_MANAGER: &str = "eklet-informer-create";

/// Field manager recorded when a shadow is updated
pub const UPDATE_FIELD_MANAGER: &str = "eklet-informer-update";

/// What a shadow sync did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Shadow and cronscaler were created
    Created,
    /// Existing shadow was replaced with the new synthesis
    Updated,
    /// Existing shadow already reflects the source
    Unchanged,
}

impl MirrorOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorOutcome::Created => "created",
            MirrorOutcome::Updated => "updated",
            MirrorOutcome::Unchanged => "unchanged",
        }
    }
}

/// Whether `deployment` gets a shadow
///
/// Shadows themselves (names carrying the prefix) are never eligible.
pub fn is_mirror_eligible(deployment: &Deployment, policy: &MirrorPolicy) -> bool {
    let name = deployment.name_any();
    if name.starts_with(&policy.prefix) {
        return false;
    }

    deployment
        .namespace()
        .is_some_and(|ns| policy.is_target(&ns, &name))
}

fn fingerprint_of(deployment: &Deployment) -> Option<&String> {
    deployment.annotations().get(annotations::SOURCE_FINGERPRINT)
}

/// Create or update the shadow of `source`
#[instrument(skip_all, fields(namespace = source.namespace().unwrap_or_default(), name = %source.name_any()))]
pub async fn sync_shadow(
    source: &Deployment,
    policy: &MirrorPolicy,
    cluster: &dyn ClusterApi,
) -> Result<MirrorOutcome> {
    let mut shadow = build_shadow(source, policy);
    let namespace = shadow.namespace().unwrap_or_default();
    let name = shadow.name_any();

    let Some(live) = cluster.get_deployment(&namespace, &name).await? else {
        info!(shadow = %name, "Shadow not found, creating");
        cluster
            .create_deployment(&shadow, CREATE_FIELD_MANAGER)
            .await?;
        cluster.create_cronscaler(&build_cronscaler(&shadow)).await?;
        info!(shadow = %name, cronscaler = %cronscaler_name(&name), "Created shadow and cronscaler");
        return Ok(MirrorOutcome::Created);
    };

    let outcome =
        if fingerprint_of(&live).is_some() && fingerprint_of(&live) == fingerprint_of(&shadow) {
            debug!(shadow = %name, "Shadow already up to date");
            MirrorOutcome::Unchanged
        } else {
            let live_replicas = live.spec.as_ref().and_then(|s| s.replicas);
            if let Some(spec) = shadow.spec.as_mut() {
                spec.replicas = live_replicas;
            }

            cluster
                .update_deployment(&shadow, UPDATE_FIELD_MANAGER)
                .await?;
            info!(shadow = %name, replicas = ?live_replicas, "Updated shadow");
            MirrorOutcome::Updated
        };

    // Creating an existing cronscaler succeeds.
    cluster.create_cronscaler(&build_cronscaler(&shadow)).await?;

    Ok(outcome)
}

/// Delete the shadow of `source` and then its cronscaler
///
/// The two deletes are independent: both are always attempted, and the first
/// failure is returned. A failure on one side leaves the other as it ended up.
#[instrument(skip_all, fields(namespace = source.namespace().unwrap_or_default(), name = %source.name_any()))]
pub async fn remove_shadow(
    source: &Deployment,
    policy: &MirrorPolicy,
    cluster: &dyn ClusterApi,
) -> Result<()> {
    let namespace = source.namespace().unwrap_or_default();
    let shadow = shadow_name(&source.name_any(), policy);
    let cronscaler = cronscaler_name(&shadow);

    let shadow_result = cluster.delete_deployment(&namespace, &shadow).await;
    match &shadow_result {
        Ok(()) => info!(shadow = %shadow, "Deleted shadow"),
        Err(e) => warn!(shadow = %shadow, error = %e, "Failed to delete shadow"),
    }

    let cronscaler_result = cluster.delete_cronscaler(&namespace, &cronscaler).await;
    match &cronscaler_result {
        Ok(()) => info!(cronscaler = %cronscaler, "Deleted cronscaler"),
        Err(e) => warn!(cronscaler = %cronscaler, error = %e, "Failed to delete cronscaler"),
    }

    shadow_result.and(cronscaler_result)
}

/// Delete managed cronscalers whose shadow no longer exists
///
/// Returns how many were deleted. Failures on individual cronscalers are
/// logged and do not stop the sweep.
pub async fn collect_orphans(cluster: &dyn ClusterApi) -> Result<usize> {
    let selector = format!("{}={}", labels::MANAGED_BY, labels::MANAGED_BY_VALUE);
    let cronscalers = cluster.list_cronscalers(&selector).await?;

    let mut deleted = 0;
    for cronscaler in cronscalers {
        let namespace = cronscaler.namespace().unwrap_or_default();
        let name = cronscaler.name_any();
        let target = &cronscaler.spec.scale_target.name;

        match cluster.get_deployment(&namespace, target).await {
            Ok(Some(_)) => {}
            Ok(None) => match cluster.delete_cronscaler(&namespace, &name).await {
                Ok(()) => {
                    info!(namespace = %namespace, cronscaler = %name, target = %target, "Deleted orphaned cronscaler");
                    deleted += 1;
                }
                Err(e) => warn!(namespace = %namespace, cronscaler = %name, error = %e, "Failed to delete orphaned cronscaler"),
            },
            Err(e) => warn!(namespace = %namespace, cronscaler = %name, error = %e, "Failed to look up cronscaler target"),
        }
    }

    Ok(deleted)
}
