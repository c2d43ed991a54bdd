//! WorkloadDeployment Custom Resource Definition
//!
//! One WorkloadDeployment exists per (placement, city code) of a Workload. It
//! is scheduled onto a Location and owns the Instances running there.

use crate::conditions::{ConditionSet, CONDITION_AVAILABLE};
use crate::crd::instance::InstanceTemplateSpec;
use crate::crd::networking::{ClusterReference, LocationReference};
use crate::crd::workload::HorizontalScaleSettings;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// WorkloadDeployment is the Schema for the workloaddeployments API
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "compute.datumapis.com",
    version = "v1alpha",
    kind = "WorkloadDeployment",
    namespaced,
    status = "WorkloadDeploymentStatus",
    shortname = "wd",
    printcolumn = r#"{"name":"City","type":"string","jsonPath":".spec.cityCode"}"#,
    printcolumn = r#"{"name":"Location","type":"string","jsonPath":".status.location.name"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredReplicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDeploymentSpec {
    /// Owning workload
    pub workload_ref: WorkloadReference,

    /// Placement this deployment was expanded from
    pub placement_name: String,

    /// City code the deployment is scheduled against
    pub city_code: String,

    #[serde(default)]
    pub template: InstanceTemplateSpec,

    pub scale_settings: HorizontalScaleSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    pub name: String,
    pub uid: String,
}

/// Status of the WorkloadDeployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDeploymentStatus {
    /// Location assigned by the scheduler, never changed once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationReference>,

    /// Execution cluster serving the assigned location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ref: Option<ClusterReference>,

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

impl WorkloadDeployment {
    pub fn location(&self) -> Option<&LocationReference> {
        self.status.as_ref().and_then(|s| s.location.as_ref())
    }

    pub fn is_available(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_true(CONDITION_AVAILABLE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_spec_parses() {
        let json = r#"{
            "workloadRef": {"name": "web", "uid": "abc"},
            "placementName": "us",
            "cityCode": "DFW",
            "scaleSettings": {"minReplicas": 1}
        }"#;
        let spec: WorkloadDeploymentSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.workload_ref.uid, "abc");
        assert_eq!(spec.city_code, "DFW");
        assert_eq!(spec.scale_settings.min_replicas, 1);
    }

    #[test]
    fn test_unscheduled_deployment() {
        let deployment = WorkloadDeployment::new("web-us-dfw", WorkloadDeploymentSpec::default());
        assert!(deployment.location().is_none());
        assert!(!deployment.is_available());
    }
}
