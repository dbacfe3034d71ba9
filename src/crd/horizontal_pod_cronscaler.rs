//! HorizontalPodCronscaler resource
//!
//! The cron-based scaler is installed and run by the cluster's autoscaling
//! add-on; this operator only creates and deletes instances of it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// HorizontalPodCronscaler specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "autoscaling.cloud.tencent.com",
    version = "v1",
    kind = "HorizontalPodCronscaler",
    plural = "horizontalpodcronscalers",
    singular = "horizontalpodcronscaler",
    shortname = "hpc",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalPodCronscalerSpec {
    /// Workload scaled by this cronscaler
    pub scale_target: ScaleTargetRef,

    /// Scheduled scaling steps
    #[serde(default)]
    pub crons: Vec<CronEntry>,
}

/// Reference to the scaled workload
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// One scheduled scaling step
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CronEntry {
    /// Step name, unique within the cronscaler
    pub name: String,

    /// Cron expression
    pub schedule: String,

    /// Replica count applied when the schedule fires
    pub target_size: i32,
}
