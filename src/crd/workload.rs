//! Workload Custom Resource Definition
//!
//! A Workload describes the instances to run and the placements they should
//! run in. The workload controller expands each placement into one
//! WorkloadDeployment per matched city code.

use crate::conditions::ConditionSet;
use crate::crd::instance::InstanceTemplateSpec;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Workload is the Schema for the workloads API
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "compute.datumapis.com",
    version = "v1alpha",
    kind = "Workload",
    namespaced,
    status = "WorkloadStatus",
    shortname = "wl",
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Template every instance of the workload is created from
    #[serde(default)]
    pub template: InstanceTemplateSpec,

    /// Where instances should be placed
    #[serde(default)]
    pub placements: Vec<WorkloadPlacement>,

    /// Gateway fronting the workload's instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<WorkloadGateway>,
}

/// A named placement intent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPlacement {
    /// Unique within the workload
    pub name: String,

    /// City codes to deploy to, matched against Location topology
    #[serde(default)]
    pub city_codes: Vec<String>,

    pub scale_settings: HorizontalScaleSettings,
}

/// Horizontal scaling bounds for a placement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaleSettings {
    /// Instances kept per deployment
    pub min_replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Recorded but not evaluated by this operator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,

    #[serde(default)]
    pub instance_management_policy: InstanceManagementPolicy,
}

/// How instances of a deployment are rolled out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum InstanceManagementPolicy {
    /// One instance at a time, in ordinal order, waiting for readiness
    #[default]
    OrderedReady,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceMetricSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetricSource {
    /// Resource name, e.g. `cpu`
    pub name: String,
    pub target: MetricTarget,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_value: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_utilization: Option<i32>,
}

/// Gateway configuration, carried as data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadGateway {
    pub template: WorkloadGatewayTemplate,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tcp_routes: Vec<TcpRouteSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadGatewayTemplate {
    pub spec: GatewaySpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    pub gateway_class_name: String,

    #[serde(default)]
    pub listeners: Vec<GatewayListener>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayListener {
    pub name: String,
    pub port: i32,
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouteSpec {
    #[serde(default)]
    pub rules: Vec<TcpRouteRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Status of the Workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub conditions: ConditionSet,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub current_replicas: i32,

    #[serde(default)]
    pub desired_replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    /// One entry per placement that has deployments
    #[serde(default)]
    pub placements: Vec<WorkloadPlacementStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<WorkloadGatewayStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPlacementStatus {
    pub name: String,

    #[serde(default)]
    pub conditions: ConditionSet,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub current_replicas: i32,

    #[serde(default)]
    pub desired_replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadGatewayStatus {
    #[serde(default)]
    pub addresses: Vec<GatewayStatusAddress>,

    #[serde(default)]
    pub conditions: ConditionSet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatusAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,

    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_spec_defaults() {
        let json = r#"{
            "placements": [{"name": "us", "cityCodes": ["DFW"], "scaleSettings": {"minReplicas": 2}}]
        }"#;
        let spec: WorkloadSpec = serde_json::from_str(json).unwrap();
        let placement = &spec.placements[0];
        assert_eq!(placement.scale_settings.min_replicas, 2);
        assert_eq!(
            placement.scale_settings.instance_management_policy,
            InstanceManagementPolicy::OrderedReady
        );
        assert!(spec.gateway.is_none());
    }

    #[test]
    fn test_management_policy_default() {
        assert_eq!(
            InstanceManagementPolicy::default(),
            InstanceManagementPolicy::OrderedReady
        );
    }

    #[test]
    fn test_status_defaults() {
        let status: WorkloadStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.replicas, 0);
        assert!(status.conditions.is_empty());
        assert!(status.placements.is_empty());
    }
}
