//! Custom Resource Definitions for the workload operator
//!
//! Compute kinds (`compute.datumapis.com/v1alpha`), managed by this operator:
//! - Workload: instances to run and where to place them
//! - WorkloadDeployment: one placement in one city
//! - Instance: a single runnable unit with an ordinal identity
//!
//! Networking kinds (`networking.datumapis.com/v1alpha`) are consumed.

mod deployment;
mod instance;
mod networking;
mod workload;

pub use deployment::{
    WorkloadDeployment, WorkloadDeploymentSpec, WorkloadDeploymentStatus, WorkloadReference,
};
pub use instance::{
    ContainerResourceRequirements, DiskPopulator, DiskSpec, DiskTemplate, DiskTemplateVolumeSource,
    Instance, InstanceController, InstanceControllerStatus, InstanceNetworkInterface,
    InstanceNetworkInterfaceAssignments, InstanceNetworkInterfaceNetworkPolicy,
    InstanceNetworkInterfaceStatus, InstanceRuntimeResources, InstanceRuntimeSpec, InstanceSpec,
    InstanceStatus, InstanceTemplateSpec, InstanceVolume, IpBlock, LocalSecretReference, NamedPort,
    NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort, SandboxContainer,
    SandboxRuntime, SchedulingGate, TemplateMetadata, VirtualMachineRuntime, VolumeAttachment,
    VolumeSource,
};
pub use networking::{
    ClusterReference, GcpLocationProvider, IpFamily, LocalNetworkContextRef, LocalSubnetReference,
    Location, LocationProvider, LocationReference, LocationSpec, LocationStatus, Network,
    NetworkBinding, NetworkBindingSpec, NetworkBindingStatus, NetworkContext, NetworkContextRef,
    NetworkContextSpec, NetworkContextStatus, NetworkIpam, NetworkRef, NetworkSpec, NetworkStatus,
    Subnet, SubnetClaim, SubnetClaimSpec, SubnetClaimStatus, SubnetSpec, SubnetStatus,
    CITY_CODE_TOPOLOGY_KEY, SUBNET_CLASS_PRIVATE,
};
pub use workload::{
    BackendRef, GatewayListener, GatewaySpec, GatewayStatusAddress, HorizontalScaleSettings,
    InstanceManagementPolicy, MetricSpec, MetricTarget, ResourceMetricSource, TcpRouteRule,
    TcpRouteSpec, Workload, WorkloadGateway, WorkloadGatewayStatus, WorkloadGatewayTemplate,
    WorkloadPlacement, WorkloadPlacementStatus, WorkloadSpec, WorkloadStatus,
};

/// UID of the owning Workload, set on deployments and instances
pub const WORKLOAD_UID_LABEL: &str = "compute.datumapis.com/workload-uid";

/// UID of the owning WorkloadDeployment, set on instances
pub const WORKLOAD_DEPLOYMENT_UID_LABEL: &str = "compute.datumapis.com/workload-deployment-uid";

/// Ordinal slot of an instance
pub const INSTANCE_INDEX_LABEL: &str = "compute.datumapis.com/instance-index";
