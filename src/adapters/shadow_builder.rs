//! Shadow Deployment and cronscaler builders
//!
//! A shadow is a copy of a source Deployment renamed with the mirror prefix,
//! scaled to zero and pinned to the eklet node pool. Its identity is always
//! recomputed from the source, never stored.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::{annotations, labels, MirrorPolicy, ISOLATION_TAINT_KEY};
use crate::crd::{CronEntry, HorizontalPodCronscaler, HorizontalPodCronscalerSpec, ScaleTargetRef};

/// Suffix appended to the shadow name to name its cronscaler
pub const CRONSCALER_SUFFIX: &str = "-hpc";

/// Name of the shadow mirroring `source_name`
pub fn shadow_name(source_name: &str, policy: &MirrorPolicy) -> String {
    format!("{}{}", policy.prefix, source_name)
}

/// Name of the cronscaler attached to `shadow_name`
pub fn cronscaler_name(shadow_name: &str) -> String {
    format!("{}{}", shadow_name, CRONSCALER_SUFFIX)
}

/// Fingerprint of everything a shadow is derived from
///
/// Changes whenever the source spec or the mirror placement changes.
pub fn source_fingerprint(source: &Deployment, policy: &MirrorPolicy) -> String {
    let mut hasher = Sha256::new();
    let spec_json = serde_json::to_string(&source.spec).unwrap_or_default();
    let selector_json = serde_json::to_string(&policy.node_selector).unwrap_or_default();
    hasher.update(spec_json.as_bytes());
    hasher.update(selector_json.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Build the shadow Deployment for `source`
pub fn build_shadow(source: &Deployment, policy: &MirrorPolicy) -> Deployment {
    let mut shadow = source.clone();
    let fingerprint = source_fingerprint(source, policy);

    strip_server_fields(&mut shadow.metadata);
    shadow.metadata.name = Some(shadow_name(&source.name_any(), policy));
    shadow.status = None;

    let object_annotations = shadow.metadata.annotations.get_or_insert_with(BTreeMap::new);
    object_annotations.remove(annotations::REVISION);
    object_annotations.remove(annotations::LAST_APPLIED);
    object_annotations.insert(annotations::OPT_OUT.to_string(), "true".to_string());
    object_annotations.insert(annotations::SOURCE_FINGERPRINT.to_string(), fingerprint);

    shadow
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        );

    let spec = shadow.spec.get_or_insert_with(Default::default);
    spec.replicas = Some(0);

    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(annotations::DS_INJECTION.to_string(), "true".to_string());

    let pod_spec = spec.template.spec.get_or_insert_with(Default::default);
    pod_spec.node_selector = if policy.node_selector.is_empty() {
        None
    } else {
        Some(policy.node_selector.clone())
    };

    let tolerations = pod_spec.tolerations.get_or_insert_with(Vec::new);
    let isolation = isolation_toleration();
    if !tolerations.contains(&isolation) {
        tolerations.push(isolation);
    }

    shadow
}

/// Build the cronscaler that scales `shadow`
///
/// Both schedules start at size zero; the autoscaling team edits them in place.
pub fn build_cronscaler(shadow: &Deployment) -> HorizontalPodCronscaler {
    let shadow_name = shadow.name_any();
    let name = cronscaler_name(&shadow_name);

    let mut cronscaler = HorizontalPodCronscaler::new(
        &name,
        HorizontalPodCronscalerSpec {
            scale_target: ScaleTargetRef {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: shadow_name.clone(),
            },
            crons: vec![
                CronEntry {
                    name: "scale-up".to_string(),
                    schedule: "0 8 * * *".to_string(),
                    target_size: 0,
                },
                CronEntry {
                    name: "scale-down".to_string(),
                    schedule: "0 20 * * *".to_string(),
                    target_size: 0,
                },
            ],
        },
    );

    cronscaler.metadata.namespace = shadow.namespace();
    cronscaler.metadata.labels = Some(BTreeMap::from([
        (
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        ),
        (labels::SHADOW.to_string(), shadow_name),
    ]));

    cronscaler
}

fn isolation_toleration() -> Toleration {
    Toleration {
        key: Some(ISOLATION_TAINT_KEY.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }
}

/// Clear identity and bookkeeping the API server assigns
fn strip_server_fields(metadata: &mut ObjectMeta) {
    metadata.uid = None;
    metadata.resource_version = None;
    metadata.creation_timestamp = None;
    metadata.deletion_timestamp = None;
    metadata.deletion_grace_period_seconds = None;
    metadata.generation = None;
    metadata.managed_fields = None;
    metadata.self_link = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    fn policy() -> MirrorPolicy {
        MirrorPolicy::new(
            "ek-",
            BTreeMap::from([("pool".to_string(), "eklet".to_string())]),
            [("ns".to_string(), "app1".to_string())],
        )
    }

    fn source() -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("app1".to_string()),
                namespace: Some("ns".to_string()),
                uid: Some("uid-1".to_string()),
                resource_version: Some("42".to_string()),
                generation: Some(7),
                annotations: Some(BTreeMap::from([
                    (annotations::REVISION.to_string(), "3".to_string()),
                    (annotations::LAST_APPLIED.to_string(), "{}".to_string()),
                    ("team".to_string(), "a".to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(4),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            ..Default::default()
                        }],
                        node_selector: Some(BTreeMap::from([(
                            "pool".to_string(),
                            "default".to_string(),
                        )])),
                        tolerations: Some(vec![Toleration {
                            key: Some("dedicated".to_string()),
                            operator: Some("Exists".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                replicas: Some(4),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_shadow_identity() {
        let shadow = build_shadow(&source(), &policy());
        assert_eq!(shadow.metadata.name.as_deref(), Some("ek-app1"));
        assert_eq!(shadow.metadata.namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn test_shadow_scaled_to_zero_on_eklet_pool() {
        let shadow = build_shadow(&source(), &policy());
        let spec = shadow.spec.unwrap();
        assert_eq!(spec.replicas, Some(0));

        let pod = spec.template.spec.unwrap();
        assert_eq!(
            pod.node_selector,
            Some(BTreeMap::from([("pool".to_string(), "eklet".to_string())]))
        );

        let tolerations = pod.tolerations.unwrap();
        assert_eq!(tolerations.len(), 2);
        assert_eq!(tolerations[1], isolation_toleration());

        let template_annotations = spec.template.metadata.unwrap().annotations.unwrap();
        assert_eq!(template_annotations[annotations::DS_INJECTION], "true");
    }

    #[test]
    fn test_shadow_is_opted_out_and_stripped() {
        let shadow = build_shadow(&source(), &policy());
        let meta = &shadow.metadata;
        assert!(meta.uid.is_none());
        assert!(meta.resource_version.is_none());
        assert!(meta.generation.is_none());
        assert!(shadow.status.is_none());

        let object_annotations = meta.annotations.as_ref().unwrap();
        assert_eq!(object_annotations[annotations::OPT_OUT], "true");
        assert_eq!(object_annotations["team"], "a");
        assert!(!object_annotations.contains_key(annotations::REVISION));
        assert!(!object_annotations.contains_key(annotations::LAST_APPLIED));
        assert_eq!(
            meta.labels.as_ref().unwrap()[labels::MANAGED_BY],
            labels::MANAGED_BY_VALUE
        );
    }

    #[test]
    fn test_source_is_untouched() {
        let original = source();
        let _ = build_shadow(&original, &policy());
        assert_eq!(original, source());
    }

    #[test]
    fn test_isolation_toleration_not_duplicated() {
        let once = build_shadow(&source(), &policy());
        let mut resynth_source = once.clone();
        resynth_source.metadata.name = Some("app1".to_string());
        let twice = build_shadow(&resynth_source, &policy());
        let count = twice
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .tolerations
            .unwrap()
            .iter()
            .filter(|t| t.key.as_deref() == Some(ISOLATION_TAINT_KEY))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_fingerprint_tracks_spec_and_placement() {
        let base = source_fingerprint(&source(), &policy());
        assert_eq!(base, source_fingerprint(&source(), &policy()));

        let mut changed = source();
        changed.spec.as_mut().unwrap().replicas = Some(5);
        assert_ne!(base, source_fingerprint(&changed, &policy()));

        let mut metadata_only = source();
        metadata_only.metadata.resource_version = Some("43".to_string());
        assert_eq!(base, source_fingerprint(&metadata_only, &policy()));

        let moved = MirrorPolicy::new(
            "ek-",
            BTreeMap::from([("pool".to_string(), "other".to_string())]),
            [],
        );
        assert_ne!(base, source_fingerprint(&source(), &moved));
    }

    #[test]
    fn test_cronscaler_targets_shadow() {
        let shadow = build_shadow(&source(), &policy());
        let cronscaler = build_cronscaler(&shadow);

        assert_eq!(cronscaler.metadata.name.as_deref(), Some("ek-app1-hpc"));
        assert_eq!(cronscaler.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(cronscaler.spec.scale_target.name, "ek-app1");
        assert_eq!(cronscaler.spec.scale_target.kind, "Deployment");

        let names: Vec<_> = cronscaler.spec.crons.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["scale-up", "scale-down"]);
        assert!(cronscaler.spec.crons.iter().all(|c| c.target_size == 0));
        assert_eq!(
            cronscaler.metadata.labels.unwrap()[labels::SHADOW],
            "ek-app1"
        );
    }
}
