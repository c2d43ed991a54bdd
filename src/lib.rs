//! Workload Kubernetes Operator
//!
//! A Kubernetes operator that turns declarative Workloads into running
//! Instances placed on Locations.
//!
//! ## Custom Resources
//!
//! - `Workload`: instances to run and the placements they should run in
//! - `WorkloadDeployment`: one placement expanded onto one city code, owning
//!   its Instances
//! - `Instance`: a single container sandbox or virtual machine with an ordinal
//!   identity
//!
//! Networking kinds (`Network`, `NetworkBinding`, `NetworkContext`,
//! `SubnetClaim`, `Subnet`) and `Location` are consumed, not owned.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: compute.datumapis.com/v1alpha
//! kind: Workload
//! metadata:
//!   name: web
//! spec:
//!   template:
//!     spec:
//!       runtime:
//!         resources:
//!           instanceType: datumcloud/d1-standard-2
//!         sandbox:
//!           containers:
//!             - name: app
//!               image: nginx:1.27
//!       networkInterfaces:
//!         - network:
//!             name: default
//!   placements:
//!     - name: us
//!       cityCodes: [DFW, LAX]
//!       scaleSettings:
//!         minReplicas: 2
//! ```

pub mod clusters;
pub mod conditions;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod indexers;
pub mod instance_control;
pub mod leader_election;
pub mod network;
pub mod store;

pub use controllers::{
    DeploymentReconciler, DeploymentScheduler, InstanceReconciler, WorkloadReconciler,
};
pub use crd::{Instance, Location, Workload, WorkloadDeployment};
pub use error::{OperatorError, Result};
