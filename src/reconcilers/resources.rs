//! Resource policy comparison and enforcement

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use crate::adapters::quantity::ParsedQuantity;
use crate::config::{annotations, PolicyQuantity, ResourcePolicy};
use crate::controllers::Context;
use crate::reconcilers::rollout;
use crate::Result;

/// Field manager recorded on enforcement updates
pub const FIELD_MANAGER: &str = "set-resource-client";

/// What an enforcement attempt did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnforceOutcome {
    /// Carries the opt-out annotation
    OptedOut,
    /// The designated container is not present
    NoContainer,
    /// Resources already equal the policy
    Compliant,
    /// No update permit was free; the next observation retries
    PermitsExhausted,
    /// The update was submitted and rolled out
    Applied,
}

impl EnforceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforceOutcome::OptedOut => "opted_out",
            EnforceOutcome::NoContainer => "no_container",
            EnforceOutcome::Compliant => "compliant",
            EnforceOutcome::PermitsExhausted => "permits_exhausted",
            EnforceOutcome::Applied => "applied",
        }
    }
}

/// Whether the Deployment carries `not-reset-resources: "true"`
pub fn is_opted_out(deployment: &Deployment) -> bool {
    deployment
        .annotations()
        .get(annotations::OPT_OUT)
        .is_some_and(|v| v == "true")
}

/// The container resources are enforced on
pub fn designated_container<'a>(
    deployment: &'a Deployment,
    container_name: &str,
) -> Option<&'a Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container_name)
}

/// Resources of the designated container, empty when unset or absent
pub fn designated_resources(deployment: &Deployment, container_name: &str) -> ResourceRequirements {
    designated_container(deployment, container_name)
        .and_then(|c| c.resources.clone())
        .unwrap_or_default()
}

/// Compare observed requirements with the policy by quantity value
///
/// `1000m` equals `1` and `1024Mi` equals `1Gi`. Unset requirements never match.
pub fn resources_match(observed: &ResourceRequirements, policy: &ResourcePolicy) -> bool {
    let matches = |list: &Option<BTreeMap<String, Quantity>>, key: &str, want: &PolicyQuantity| {
        list.as_ref()
            .and_then(|l| l.get(key))
            .and_then(|q| ParsedQuantity::from_quantity(q).ok())
            .is_some_and(|have| have == want.parsed)
    };

    matches(&observed.requests, "cpu", &policy.cpu_request)
        && matches(&observed.requests, "memory", &policy.memory_request)
        && matches(&observed.limits, "cpu", &policy.cpu_limit)
        && matches(&observed.limits, "memory", &policy.memory_limit)
}

/// Copy of `deployment` with the policy written onto the designated container
///
/// The resource version is cleared so the update is not rejected for
/// conflicting with a newer observation.
pub fn apply_policy(
    deployment: &Deployment,
    policy: &ResourcePolicy,
    container_name: &str,
) -> Deployment {
    let mut desired = deployment.clone();
    desired.metadata.resource_version = None;

    if let Some(container) = desired
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.iter_mut().find(|c| c.name == container_name))
    {
        container.resources = Some(policy.requirements());
    }

    desired
}

/// Enforce the resource policy on one observed Deployment
#[instrument(skip_all, fields(namespace = deployment.namespace().unwrap_or_default(), name = %deployment.name_any()))]
pub async fn enforce(
    deployment: &Deployment,
    policy: &ResourcePolicy,
    ctx: &Context,
) -> Result<EnforceOutcome> {
    if is_opted_out(deployment) {
        debug!("Opt-out annotation set, skipping");
        return Ok(EnforceOutcome::OptedOut);
    }

    let container_name = &ctx.settings.container_name;
    let Some(container) = designated_container(deployment, container_name) else {
        debug!(container = %container_name, "Designated container not found");
        return Ok(EnforceOutcome::NoContainer);
    };

    if container
        .resources
        .as_ref()
        .is_some_and(|r| resources_match(r, policy))
    {
        return Ok(EnforceOutcome::Compliant);
    }

    let Ok(_permit) = ctx.update_permits.try_acquire() else {
        warn!("No update permit available, skipping until next observation");
        return Ok(EnforceOutcome::PermitsExhausted);
    };

    let desired = apply_policy(deployment, policy, container_name);
    let updated = ctx
        .cluster
        .update_deployment(&desired, FIELD_MANAGER)
        .await?;

    info!(
        cpu_request = %policy.cpu_request.literal.0,
        memory_request = %policy.memory_request.literal.0,
        cpu_limit = %policy.cpu_limit.literal.0,
        memory_limit = %policy.memory_limit.literal.0,
        "Updated Deployment resources"
    );

    rollout::await_rollout(
        ctx.cluster.as_ref(),
        &updated,
        &ctx.settings.rollout,
        &ctx.shutdown,
    )
    .await?;

    Ok(EnforceOutcome::Applied)
}
