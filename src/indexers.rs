//! Reverse indexes used to fan watch events out to the objects that depend on
//! them.
//!
//! Index functions map an object to the keys it is filed under; lookups run
//! against a controller's reflector cache.

use crate::crd::{Workload, WorkloadDeployment};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::sync::Arc;

/// `namespace/name` key of any namespaced object
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Location a deployment is scheduled to, empty while unscheduled
pub fn deployment_location_index(deployment: &WorkloadDeployment) -> Vec<String> {
    deployment.location().map(|l| l.key()).into_iter().collect()
}

/// Networks referenced by the workload's interfaces. References without a
/// namespace resolve to the workload's own.
pub fn workload_networks_index(workload: &Workload) -> Vec<String> {
    let default_namespace = workload.namespace().unwrap_or_default();
    let keys: BTreeSet<String> = workload
        .spec
        .template
        .spec
        .network_interfaces
        .iter()
        .map(|iface| {
            let namespace = iface.network.namespace.as_deref().unwrap_or(&default_namespace);
            format!("{}/{}", namespace, iface.network.name)
        })
        .collect();
    keys.into_iter().collect()
}

/// Deployments scheduled to the location with the given key
pub fn deployments_at_location(
    deployments: Vec<Arc<WorkloadDeployment>>,
    location_key: &str,
) -> Vec<ObjectRef<WorkloadDeployment>> {
    deployments
        .into_iter()
        .filter(|d| deployment_location_index(d).iter().any(|k| k == location_key))
        .map(|d| ObjectRef::from_obj(&*d))
        .collect()
}

/// Workloads whose interfaces reference the network with the given key
pub fn workloads_using_network(
    workloads: Vec<Arc<Workload>>,
    network_key: &str,
) -> Vec<ObjectRef<Workload>> {
    workloads
        .into_iter()
        .filter(|w| workload_networks_index(w).iter().any(|k| k == network_key))
        .map(|w| ObjectRef::from_obj(&*w))
        .collect()
}
