//! Operator configuration
//!
//! The YAML file is deserialized into [`LocalConfig`] and then validated into
//! an immutable [`Settings`] value shared by every reconciler. A malformed
//! file is fatal at startup; nothing here is re-read while running.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::adapters::quantity::ParsedQuantity;
use crate::{Error, Result};

/// Container whose resources are enforced when `containerName` is not set
pub const DEFAULT_CONTAINER_NAME: &str = "app";

/// Annotations read and written by the operator
pub mod annotations {
    /// Set to "true" to exempt a Deployment from resource enforcement
    pub const OPT_OUT: &str = "not-reset-resources";
    /// Pod template annotation enabling daemonset injection on eklet nodes
    pub const DS_INJECTION: &str = "eks.tke.cloud.tencent.com/ds-injection";
    /// Fingerprint of the source spec a shadow was synthesized from
    pub const SOURCE_FINGERPRINT: &str = "workload-policy-operator/source-fingerprint";
    /// Server-maintained rollout revision
    pub const REVISION: &str = "deployment.kubernetes.io/revision";
    /// kubectl client-side apply bookkeeping
    pub const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";
}

/// Labels written by the operator
pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "workload-policy-operator";
    /// Shadow Deployment a cronscaler scales
    pub const SHADOW: &str = "workload-policy-operator/shadow";
}

/// Taint carried by eklet virtual nodes
pub const ISOLATION_TAINT_KEY: &str = "eks.tke.cloud.tencent.com/eklet";

/// On-disk configuration file
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    /// Resource requests and limits applied to the designated container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceSpec>,

    /// Namespaces in which resources are enforced
    #[serde(default)]
    pub include_namespace: Vec<String>,

    /// Maximum number of enforcement updates in flight
    #[serde(default = "default_update_deploy_rate_max")]
    pub update_deploy_rate_max: usize,

    /// Deployments mirrored onto the eklet node pool
    #[serde(default)]
    pub eklet_deployment: EkletDeploymentSpec,

    /// Name of the container whose resources are enforced
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Worker pool sizing
    #[serde(default)]
    pub workers: WorkerSpec,

    /// Rollout confirmation tuning
    #[serde(default)]
    pub rollout: RolloutSpec,

    /// Period of the orphaned cronscaler sweep
    #[serde(default = "default_orphan_sweep_seconds")]
    pub orphan_sweep_seconds: u64,
}

fn default_update_deploy_rate_max() -> usize {
    20
}

fn default_container_name() -> String {
    DEFAULT_CONTAINER_NAME.to_string()
}

fn default_orphan_sweep_seconds() -> u64 {
    600
}

/// Requests and limits section
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub requests: CpuAndMemory,
    pub limits: CpuAndMemory,
}

/// CPU and memory quantity strings
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuAndMemory {
    #[serde(deserialize_with = "quantity_string")]
    pub cpu: String,
    #[serde(deserialize_with = "quantity_string")]
    pub memory: String,
}

/// Accept `cpu: 1` as well as `cpu: "1"`
fn quantity_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Integer(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
    })
}

/// Mirroring section
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EkletDeploymentSpec {
    /// `namespace/name` entries eligible for mirroring
    #[serde(default, rename = "deloyment", alias = "deployment")]
    pub deployment: Vec<String>,

    /// Node selector placed on every shadow
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Prefix prepended to the source name to form the shadow name
    #[serde(default)]
    pub prefix: String,
}

/// Worker pool sizing per reconciliation kind
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    #[serde(default = "default_enforcement_workers")]
    pub enforcement: usize,
    #[serde(default = "default_mirror_workers")]
    pub mirror: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            enforcement: default_enforcement_workers(),
            mirror: default_mirror_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_enforcement_workers() -> usize {
    32
}

fn default_mirror_workers() -> usize {
    8
}

fn default_queue_depth() -> usize {
    256
}

/// Rollout confirmation section
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpec {
    #[serde(default = "default_rollout_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_rollout_attempts")]
    pub attempts: u32,
}

impl Default for RolloutSpec {
    fn default() -> Self {
        Self {
            interval_seconds: default_rollout_interval(),
            attempts: default_rollout_attempts(),
        }
    }
}

fn default_rollout_interval() -> u64 {
    3
}

fn default_rollout_attempts() -> u32 {
    20
}

/// Which controller features are switched on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Features {
    /// Enforce the resource policy on the designated container
    pub enforce_resources: bool,
    /// Mirror selected Deployments into zero-scaled shadows
    pub mirror_deployments: bool,
}

impl Features {
    pub fn any(&self) -> bool {
        self.enforce_resources || self.mirror_deployments
    }
}

/// A policy quantity kept in both its literal and normalised forms
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyQuantity {
    pub literal: Quantity,
    pub parsed: ParsedQuantity,
}

impl PolicyQuantity {
    fn parse(field: &str, value: &str) -> Result<Self> {
        let parsed = value
            .parse()
            .map_err(|e| Error::ConfigError(format!("{}: {}", field, e)))?;
        Ok(Self {
            literal: Quantity(value.to_string()),
            parsed,
        })
    }
}

/// Resource requests and limits every matching container must carry
#[derive(Clone, Debug, PartialEq)]
pub struct ResourcePolicy {
    pub cpu_request: PolicyQuantity,
    pub memory_request: PolicyQuantity,
    pub cpu_limit: PolicyQuantity,
    pub memory_limit: PolicyQuantity,
}

impl ResourcePolicy {
    /// Parse every quantity of the resource section
    pub fn from_spec(spec: &ResourceSpec) -> Result<Self> {
        Ok(Self {
            cpu_request: PolicyQuantity::parse("resource.requests.cpu", &spec.requests.cpu)?,
            memory_request: PolicyQuantity::parse(
                "resource.requests.memory",
                &spec.requests.memory,
            )?,
            cpu_limit: PolicyQuantity::parse("resource.limits.cpu", &spec.limits.cpu)?,
            memory_limit: PolicyQuantity::parse("resource.limits.memory", &spec.limits.memory)?,
        })
    }

    /// Requirements written onto a container when the policy is applied
    pub fn requirements(&self) -> ResourceRequirements {
        let pair = |cpu: &PolicyQuantity, memory: &PolicyQuantity| {
            BTreeMap::from([
                ("cpu".to_string(), cpu.literal.clone()),
                ("memory".to_string(), memory.literal.clone()),
            ])
        };

        ResourceRequirements {
            requests: Some(pair(&self.cpu_request, &self.memory_request)),
            limits: Some(pair(&self.cpu_limit, &self.memory_limit)),
            ..Default::default()
        }
    }
}

/// Namespaces admitted for resource enforcement
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceFilter(HashSet<String>);

impl NamespaceFilter {
    pub fn admits(&self, namespace: &str) -> bool {
        self.0.contains(namespace)
    }
}

impl<S: Into<String>> FromIterator<S> for NamespaceFilter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// How shadows are named, placed, and which sources get one
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorPolicy {
    pub prefix: String,
    pub node_selector: BTreeMap<String, String>,
    targets: BTreeMap<String, BTreeSet<String>>,
}

impl MirrorPolicy {
    pub fn new(
        prefix: impl Into<String>,
        node_selector: BTreeMap<String, String>,
        targets: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut by_namespace: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (namespace, name) in targets {
            by_namespace.entry(namespace).or_default().insert(name);
        }
        Self {
            prefix: prefix.into(),
            node_selector,
            targets: by_namespace,
        }
    }

    /// Whether `namespace/name` is listed as a mirror source
    pub fn is_target(&self, namespace: &str, name: &str) -> bool {
        self.targets
            .get(namespace)
            .is_some_and(|names| names.contains(name))
    }

    pub fn target_count(&self) -> usize {
        self.targets.values().map(BTreeSet::len).sum()
    }
}

/// Rollout polling parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolloutSettings {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(default_rollout_interval()),
            attempts: default_rollout_attempts(),
        }
    }
}

/// Validated, immutable configuration for one operator run
#[derive(Clone, Debug)]
pub struct Settings {
    pub features: Features,
    /// Present whenever resource enforcement is enabled
    pub resource_policy: Option<ResourcePolicy>,
    pub namespaces: NamespaceFilter,
    pub mirror: MirrorPolicy,
    pub container_name: String,
    pub update_permits: usize,
    pub workers: WorkerSpec,
    pub rollout: RolloutSettings,
    pub orphan_sweep_interval: Duration,
}

impl Settings {
    /// Validate a parsed configuration file for the enabled features
    pub fn from_config(config: LocalConfig, features: Features) -> Result<Self> {
        let resource_policy = match (&config.resource, features.enforce_resources) {
            (Some(spec), _) => Some(ResourcePolicy::from_spec(spec)?),
            (None, true) => {
                return Err(Error::ConfigError(
                    "resource section is required when resource enforcement is enabled"
                        .to_string(),
                ))
            }
            (None, false) => None,
        };

        if config.update_deploy_rate_max == 0 {
            return Err(Error::ConfigError(
                "updateDeployRateMax must be >= 1".to_string(),
            ));
        }

        if config.workers.enforcement == 0 || config.workers.mirror == 0 {
            return Err(Error::ConfigError(
                "workers.enforcement and workers.mirror must be >= 1".to_string(),
            ));
        }

        if config.workers.queue_depth == 0 {
            return Err(Error::ConfigError(
                "workers.queueDepth must be >= 1".to_string(),
            ));
        }

        if config.rollout.attempts == 0 {
            return Err(Error::ConfigError(
                "rollout.attempts must be >= 1".to_string(),
            ));
        }

        if config.container_name.is_empty() {
            return Err(Error::ConfigError(
                "containerName cannot be empty".to_string(),
            ));
        }

        let eklet = config.eklet_deployment;
        if features.mirror_deployments && eklet.prefix.is_empty() {
            return Err(Error::ConfigError(
                "ekletDeployment.prefix cannot be empty when mirroring is enabled".to_string(),
            ));
        }

        let targets = eklet
            .deployment
            .iter()
            .map(|entry| parse_target(entry))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            features,
            resource_policy,
            namespaces: config.include_namespace.into_iter().collect(),
            mirror: MirrorPolicy::new(eklet.prefix, eklet.node_selector, targets),
            container_name: config.container_name,
            update_permits: config.update_deploy_rate_max,
            workers: config.workers,
            rollout: RolloutSettings {
                interval: Duration::from_secs(config.rollout.interval_seconds),
                attempts: config.rollout.attempts,
            },
            orphan_sweep_interval: Duration::from_secs(config.orphan_sweep_seconds.max(1)),
        })
    }
}

/// Parse a `namespace/name` mirror target
fn parse_target(entry: &str) -> Result<(String, String)> {
    match entry.trim().split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(Error::ConfigError(format!(
            "ekletDeployment.deloyment entry '{}' must be of the form namespace/name",
            entry
        ))),
    }
}

/// Parse configuration YAML
pub fn parse(yaml: &str) -> Result<LocalConfig> {
    serde_yaml::from_str(yaml)
        .map_err(|e| Error::ConfigError(format!("Failed to parse config: {}", e)))
}

/// Read and parse the configuration file at `path`
pub fn load(path: &Path) -> Result<LocalConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    parse(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
resource:
  requests: { cpu: 10m, memory: 56Mi }
  limits:   { cpu: 2000m, memory: 2048Mi }
includeNamespace: [team-a, team-b]
updateDeployRateMax: 5
ekletDeployment:
  deloyment: [ "ns/app1", "ns/app2", "other/app1" ]
  nodeSelector: { pool: eklet }
  prefix: ek-
"#;

    fn both() -> Features {
        Features {
            enforce_resources: true,
            mirror_deployments: true,
        }
    }

    #[test]
    fn test_parse_sample() {
        let settings = Settings::from_config(parse(SAMPLE).unwrap(), both()).unwrap();

        assert!(settings.namespaces.admits("team-a"));
        assert!(!settings.namespaces.admits("team-c"));
        assert_eq!(settings.update_permits, 5);
        assert_eq!(settings.container_name, "app");
        assert_eq!(settings.mirror.prefix, "ek-");
        assert_eq!(settings.mirror.node_selector.get("pool").unwrap(), "eklet");
        assert!(settings.mirror.is_target("ns", "app1"));
        assert!(settings.mirror.is_target("ns", "app2"));
        assert!(settings.mirror.is_target("other", "app1"));
        assert!(!settings.mirror.is_target("other", "app2"));
        assert_eq!(settings.mirror.target_count(), 3);

        let policy = settings.resource_policy.unwrap();
        assert_eq!(policy.cpu_limit.parsed, "2".parse().unwrap());
        assert_eq!(policy.memory_limit.parsed, "2Gi".parse().unwrap());
    }

    #[test]
    fn test_defaults() {
        let config = parse("includeNamespace: []\n").unwrap();
        assert_eq!(config.update_deploy_rate_max, 20);
        assert_eq!(config.workers, WorkerSpec::default());
        assert_eq!(config.rollout.interval_seconds, 3);
        assert_eq!(config.rollout.attempts, 20);
        assert_eq!(config.orphan_sweep_seconds, 600);
        assert!(config.resource.is_none());
    }

    #[test]
    fn test_numeric_quantities_accepted() {
        let yaml = SAMPLE.replace("cpu: 2000m", "cpu: 2");
        let settings = Settings::from_config(parse(&yaml).unwrap(), both()).unwrap();
        let policy = settings.resource_policy.unwrap();
        assert_eq!(policy.cpu_limit.literal, Quantity("2".to_string()));
        assert_eq!(policy.cpu_limit.parsed, "2000m".parse().unwrap());
    }

    #[test]
    fn test_deployment_alias_accepted() {
        let config = parse("ekletDeployment:\n  deployment: [\"a/b\"]\n  prefix: x-\n").unwrap();
        assert_eq!(config.eklet_deployment.deployment, vec!["a/b".to_string()]);
    }

    #[test]
    fn test_resource_required_for_enforcement() {
        let config = parse("includeNamespace: [a]\n").unwrap();
        let features = Features {
            enforce_resources: true,
            mirror_deployments: false,
        };
        let err = Settings::from_config(config, features).unwrap_err();
        assert!(err.to_string().contains("resource section"));
    }

    #[test]
    fn test_bad_quantity_is_fatal() {
        let yaml = SAMPLE.replace("2048Mi", "lots");
        let err = Settings::from_config(parse(&yaml).unwrap(), both()).unwrap_err();
        assert!(matches!(err, Error::ConfigError(ref msg) if msg.contains("resource.limits.memory")));
    }

    #[test]
    fn test_empty_prefix_rejected_for_mirroring() {
        let yaml = SAMPLE.replace("prefix: ek-", "prefix: \"\"");
        assert!(Settings::from_config(parse(&yaml).unwrap(), both()).is_err());

        let enforce_only = Features {
            enforce_resources: true,
            mirror_deployments: false,
        };
        assert!(Settings::from_config(parse(&yaml).unwrap(), enforce_only).is_ok());
    }

    #[test]
    fn test_malformed_target_rejected() {
        for bad in ["justname", "/name", "ns/", "a/b/c"] {
            let yaml = SAMPLE.replace("ns/app2", bad);
            assert!(
                Settings::from_config(parse(&yaml).unwrap(), both()).is_err(),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_zero_rate_rejected() {
        let yaml = SAMPLE.replace("updateDeployRateMax: 5", "updateDeployRateMax: 0");
        assert!(Settings::from_config(parse(&yaml).unwrap(), both()).is_err());
    }

    #[test]
    fn test_policy_requirements_use_literals() {
        let settings = Settings::from_config(parse(SAMPLE).unwrap(), both()).unwrap();
        let requirements = settings.resource_policy.unwrap().requirements();
        let requests = requirements.requests.unwrap();
        let limits = requirements.limits.unwrap();
        assert_eq!(requests["cpu"], Quantity("10m".to_string()));
        assert_eq!(requests["memory"], Quantity("56Mi".to_string()));
        assert_eq!(limits["cpu"], Quantity("2000m".to_string()));
        assert_eq!(limits["memory"], Quantity("2048Mi".to_string()));
    }

    #[test]
    fn test_policies_compare_by_literal_and_value() {
        let policy = |yaml: &str| {
            Settings::from_config(parse(yaml).unwrap(), both())
                .unwrap()
                .resource_policy
                .unwrap()
        };

        assert_eq!(policy(SAMPLE), policy(SAMPLE));

        // Same amount written differently is a different configuration.
        let respelled = policy(&SAMPLE.replace("cpu: 2000m", "cpu: \"2\""));
        assert_ne!(respelled, policy(SAMPLE));
        assert_eq!(respelled.cpu_limit.parsed, policy(SAMPLE).cpu_limit.parsed);
    }
}
