//! Networking and location kinds consumed by the compute controllers
//!
//! These resources are owned by the networking subsystem. The operator only
//! reads them, creates NetworkBindings and SubnetClaims, and reacts to their
//! `Ready` conditions.

use crate::conditions::ConditionSet;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Topology key holding a Location's city code
pub const CITY_CODE_TOPOLOGY_KEY: &str = "topology.datum.net/city-code";

/// Subnet class requested for instance interfaces
pub const SUBNET_CLASS_PRIVATE: &str = "private";

/// Reference to a Network, defaulting to the referrer's namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Reference to a Location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocationReference {
    pub name: String,
    pub namespace: String,
}

impl LocationReference {
    /// `namespace/name`, the key used by the deployment location index
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Reference to an execution cluster known to the cluster registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReference {
    pub name: String,
}

/// Reference to a NetworkContext, possibly in another namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContextRef {
    pub name: String,
    pub namespace: String,
}

/// Same-namespace reference to a NetworkContext
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalNetworkContextRef {
    pub name: String,
}

/// Same-namespace reference to a Subnet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalSubnetReference {
    pub name: String,
}

/// IP family of a subnet or claim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum IpFamily {
    #[default]
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
}

/// A virtual network instances attach to
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.datumapis.com",
    version = "v1alpha",
    kind = "Network",
    namespaced,
    status = "NetworkStatus",
    shortname = "net"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Address management for the network
    #[serde(default)]
    pub ipam: NetworkIpam,

    /// Maximum transmission unit
    #[serde(default = "default_mtu")]
    pub mtu: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIpam {
    /// `Auto` or `Policy`
    #[serde(default = "default_ipam_mode")]
    pub mode: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4_ranges: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6_ranges: Vec<String>,
}

impl Default for NetworkIpam {
    fn default() -> Self {
        Self {
            mode: default_ipam_mode(),
            ipv4_ranges: Vec::new(),
            ipv6_ranges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    #[serde(default)]
    pub conditions: ConditionSet,
}

/// Binds a Network to a Location, producing a NetworkContext
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.datumapis.com",
    version = "v1alpha",
    kind = "NetworkBinding",
    namespaced,
    status = "NetworkBindingStatus",
    shortname = "netbinding",
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.network.name"}"#,
    printcolumn = r#"{"name":"Location","type":"string","jsonPath":".spec.location.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkBindingSpec {
    pub network: NetworkRef,
    pub location: LocationReference,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkBindingStatus {
    /// Context the binding resolved to, set once the binding is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_context_ref: Option<NetworkContextRef>,

    #[serde(default)]
    pub conditions: ConditionSet,
}

/// A Network materialized in one Location
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.datumapis.com",
    version = "v1alpha",
    kind = "NetworkContext",
    namespaced,
    status = "NetworkContextStatus",
    shortname = "netctx"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContextSpec {
    pub network: NetworkRef,
    pub location: LocationReference,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContextStatus {
    #[serde(default)]
    pub conditions: ConditionSet,
}

/// Request for a subnet within a NetworkContext
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.datumapis.com",
    version = "v1alpha",
    kind = "SubnetClaim",
    namespaced,
    status = "SubnetClaimStatus",
    shortname = "subnetclaim",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.subnetClass"}"#,
    printcolumn = r#"{"name":"Family","type":"string","jsonPath":".spec.ipFamily"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetClaimSpec {
    pub subnet_class: String,
    pub ip_family: IpFamily,
    pub network_context: LocalNetworkContextRef,
    pub location: LocationReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetClaimStatus {
    /// Subnet allocated to the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_ref: Option<LocalSubnetReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_address: Option<String>,

    #[serde(default)]
    pub conditions: ConditionSet,
}

/// An allocated address range
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.datumapis.com",
    version = "v1alpha",
    kind = "Subnet",
    namespaced,
    status = "SubnetStatus",
    shortname = "subnet"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    pub subnet_class: String,
    pub ip_family: IpFamily,
    pub network_context: LocalNetworkContextRef,
    pub location: LocationReference,
    pub start_address: String,
    pub prefix_length: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<i32>,

    #[serde(default)]
    pub conditions: ConditionSet,
}

/// A place instances can run, described by topology attributes
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.datumapis.com",
    version = "v1alpha",
    kind = "Location",
    namespaced,
    derive = "PartialEq",
    status = "LocationStatus",
    shortname = "loc",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.locationClassName"}"#,
    printcolumn = r#"{"name":"City","type":"string","jsonPath":".spec.topology.topology\\.datum\\.net/city-code"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LocationSpec {
    #[serde(default)]
    pub location_class_name: String,

    /// Free-form topology attributes, e.g. `topology.datum.net/city-code: DFW`
    #[serde(default)]
    pub topology: BTreeMap<String, String>,

    #[serde(default)]
    pub provider: LocationProvider,
}

/// Where a Location's instances are actually run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocationProvider {
    /// Execution cluster serving the location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpLocationProvider>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpLocationProvider {
    pub project_id: String,
    pub region: String,
    pub zone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocationStatus {
    #[serde(default)]
    pub conditions: ConditionSet,
}

impl Location {
    pub fn city_code(&self) -> Option<&str> {
        self.spec
            .topology
            .get(CITY_CODE_TOPOLOGY_KEY)
            .map(String::as_str)
    }
}

fn default_mtu() -> i32 {
    1460
}

fn default_ipam_mode() -> String {
    "Auto".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_spec_defaults() {
        let spec: NetworkSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.mtu, 1460);
        assert_eq!(spec.ipam.mode, "Auto");
    }

    #[test]
    fn test_ip_family_wire_names() {
        assert_eq!(serde_json::to_string(&IpFamily::Ipv4).unwrap(), "\"IPv4\"");
        let family: IpFamily = serde_json::from_str("\"IPv6\"").unwrap();
        assert_eq!(family, IpFamily::Ipv6);
    }

    #[test]
    fn test_location_city_code() {
        let json = r#"{"topology": {"topology.datum.net/city-code": "DFW"}}"#;
        let spec: LocationSpec = serde_json::from_str(json).unwrap();
        let location = Location::new("dfw-1", spec);
        assert_eq!(location.city_code(), Some("DFW"));
        assert!(location.spec.provider.cluster.is_none());
    }

    #[test]
    fn test_location_reference_key() {
        let loc = LocationReference {
            name: "dfw-1".to_string(),
            namespace: "datum-system".to_string(),
        };
        assert_eq!(loc.key(), "datum-system/dfw-1");
    }
}
