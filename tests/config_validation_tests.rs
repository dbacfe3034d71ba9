//! Integration tests for configuration loading, quantity equality and
//! shadow synthesis

use std::collections::BTreeMap;
use std::io::Write;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, ResourceRequirements, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use workload_policy_operator::adapters::quantity::ParsedQuantity;
use workload_policy_operator::adapters::shadow_builder::{build_shadow, shadow_name};
use workload_policy_operator::config::{
    self, annotations, Features, MirrorPolicy, NamespaceFilter, Settings, ISOLATION_TAINT_KEY,
};
use workload_policy_operator::reconcilers::mirror::is_mirror_eligible;
use workload_policy_operator::reconcilers::resources::resources_match;

// ============================================================================
// Test Helpers
// ============================================================================

const VALID_CONFIG: &str = r#"
resource:
  requests:
    cpu: 10m
    memory: 56Mi
  limits:
    cpu: 2000m
    memory: 2048Mi
includeNamespace:
  - team-a
updateDeployRateMax: 3
ekletDeployment:
  deloyment:
    - ns/app1
  nodeSelector:
    pool: eklet
  prefix: ek-
"#;

fn both_features() -> Features {
    Features {
        enforce_resources: true,
        mirror_deployments: true,
    }
}

fn settings_from(yaml: &str, features: Features) -> workload_policy_operator::Result<Settings> {
    Settings::from_config(config::parse(yaml)?, features)
}

fn mirror_policy() -> MirrorPolicy {
    MirrorPolicy::new(
        "ek-",
        BTreeMap::from([("pool".to_string(), "eklet".to_string())]),
        [("ns".to_string(), "app1".to_string())],
    )
}

fn source(namespace: &str, name: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some("0b5c".to_string()),
            resource_version: Some("42".to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(6),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some("registry/app:1".to_string()),
                        ..Default::default()
                    }],
                    node_selector: Some(BTreeMap::from([(
                        "pool".to_string(),
                        "default".to_string(),
                    )])),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn requirements(cpu_req: &str, mem_req: &str, cpu_lim: &str, mem_lim: &str) -> ResourceRequirements {
    let pair = |cpu: &str, mem: &str| {
        Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(mem.to_string())),
        ]))
    };
    ResourceRequirements {
        requests: pair(cpu_req, mem_req),
        limits: pair(cpu_lim, mem_lim),
        ..Default::default()
    }
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(VALID_CONFIG.as_bytes()).unwrap();

    let settings = Settings::from_config(config::load(file.path()).unwrap(), both_features())
        .unwrap();

    assert!(settings.namespaces.admits("team-a"));
    assert_eq!(settings.update_permits, 3);
    assert!(settings.mirror.is_target("ns", "app1"));
    assert!(settings.resource_policy.is_some());
}

#[test]
fn test_missing_config_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = config::load(&dir.path().join("absent.yaml")).unwrap_err();
    assert_eq!(err.kind(), "config");
}

#[test]
fn test_malformed_yaml_is_rejected() {
    let err = config::parse("resource: [not, a, map").unwrap_err();
    assert!(err.to_string().contains("Failed to parse config"));
}

#[test]
fn test_zero_update_permits_rejected() {
    let yaml = VALID_CONFIG.replace("updateDeployRateMax: 3", "updateDeployRateMax: 0");
    let err = settings_from(&yaml, both_features()).unwrap_err();
    assert!(err.to_string().contains("updateDeployRateMax"));
}

#[test]
fn test_malformed_mirror_target_rejected() {
    let yaml = VALID_CONFIG.replace("- ns/app1", "- app1");
    let err = settings_from(&yaml, both_features()).unwrap_err();
    assert!(err.to_string().contains("namespace/name"));
}

#[test]
fn test_empty_prefix_rejected_only_when_mirroring() {
    let yaml = VALID_CONFIG.replace("prefix: ek-", "prefix: \"\"");
    assert!(settings_from(&yaml, both_features()).is_err());

    let enforcement_only = Features {
        enforce_resources: true,
        mirror_deployments: false,
    };
    assert!(settings_from(&yaml, enforcement_only).is_ok());
}

#[test]
fn test_empty_namespace_filter_admits_nothing() {
    let yaml = VALID_CONFIG.replace("  - team-a\n", "").replace(
        "includeNamespace:\n",
        "includeNamespace: []\n",
    );
    let settings = settings_from(&yaml, both_features()).unwrap();
    assert_eq!(settings.namespaces, NamespaceFilter::default());
    assert!(!settings.namespaces.admits("team-a"));
}

// ============================================================================
// Quantity Equality Tests
// ============================================================================

#[test]
fn test_equivalent_literals_compare_equal() {
    let one: ParsedQuantity = "1".parse().unwrap();
    let thousand_milli: ParsedQuantity = "1000m".parse().unwrap();
    assert_eq!(one, thousand_milli);

    let gibi: ParsedQuantity = "1Gi".parse().unwrap();
    let mebi: ParsedQuantity = "1024Mi".parse().unwrap();
    assert_eq!(gibi, mebi);

    let decimal: ParsedQuantity = "1G".parse().unwrap();
    assert_ne!(gibi, decimal);
}

#[test]
fn test_policy_matches_equivalent_observed_resources() {
    let settings = settings_from(VALID_CONFIG, both_features()).unwrap();
    let policy = settings.resource_policy.unwrap();

    assert!(resources_match(
        &requirements("0.01", "56Mi", "2", "2Gi"),
        &policy
    ));
    assert!(!resources_match(
        &requirements("10m", "56Mi", "2", "2G"),
        &policy
    ));
}

// ============================================================================
// Shadow Synthesis Tests
// ============================================================================

#[test]
fn test_shadow_name_is_prefixed_source_name() {
    assert_eq!(shadow_name("app1", &mirror_policy()), "ek-app1");
}

#[test]
fn test_prefixed_sources_are_never_eligible() {
    let policy = MirrorPolicy::new(
        "ek-",
        BTreeMap::new(),
        [("ns".to_string(), "ek-app1".to_string())],
    );
    assert!(!is_mirror_eligible(&source("ns", "ek-app1"), &policy));
    assert!(!is_mirror_eligible(&source("ns", "app2"), &mirror_policy()));
    assert!(is_mirror_eligible(&source("ns", "app1"), &mirror_policy()));
}

#[test]
fn test_shadow_is_zero_scaled_and_placed_on_virtual_nodes() {
    let shadow = build_shadow(&source("ns", "app1"), &mirror_policy());

    assert_eq!(shadow.name_any(), "ek-app1");
    assert_eq!(shadow.namespace().as_deref(), Some("ns"));
    assert!(shadow.metadata.uid.is_none());
    assert!(shadow.metadata.resource_version.is_none());
    assert_eq!(
        shadow.annotations().get(annotations::OPT_OUT).map(String::as_str),
        Some("true")
    );

    let spec = shadow.spec.as_ref().unwrap();
    assert_eq!(spec.replicas, Some(0));

    let pod = spec.template.spec.as_ref().unwrap();
    assert_eq!(
        pod.node_selector.as_ref().unwrap().get("pool").map(String::as_str),
        Some("eklet")
    );
    let tolerations: Vec<&Toleration> = pod
        .tolerations
        .iter()
        .flatten()
        .filter(|t| t.key.as_deref() == Some(ISOLATION_TAINT_KEY))
        .collect();
    assert_eq!(tolerations.len(), 1);
}

#[test]
fn test_shadow_synthesis_is_deterministic() {
    let first = build_shadow(&source("ns", "app1"), &mirror_policy());
    let second = build_shadow(&source("ns", "app1"), &mirror_policy());
    assert_eq!(first, second);
}
