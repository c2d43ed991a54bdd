//! Controllers for the workload operator
//!
//! Each controller watches its resource and reconciles the actual state with
//! the desired state:
//! - [`WorkloadReconciler`]: expands placements into WorkloadDeployments
//! - [`DeploymentScheduler`]: assigns unscheduled deployments to a Location
//! - [`DeploymentReconciler`]: manages a deployment's Instances and networks
//! - [`InstanceReconciler`]: derives each Instance's `Ready` condition

mod deployment;
mod instance;
mod scheduler;
mod workload;

pub use deployment::{deployment_status, DeploymentReconciler, ReplicaSummary};
pub use instance::{ready_condition, InstanceReconciler};
pub use scheduler::{select_location, DeploymentScheduler, LocationSelection};
pub use workload::{aggregate_status, desired_deployments, WorkloadReconciler};

use crate::error::OperatorError;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, Resource};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Requeue delay after an optimistic concurrency conflict
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Default requeue delay after any other reconcile error
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(15);

/// Outcome of a finalizer-gated teardown pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Nothing left; the finalizer may be removed
    Finalized,
    /// Owned objects remain; wait for their watch events
    Blocked(String),
}

/// Common behaviour of the controllers
pub trait Reconciler: Send + Sync {
    /// Controller name for logging
    fn name(&self) -> &'static str;

    /// Requeue delay after a non-conflict error
    fn error_backoff(&self) -> Duration;
}

/// Cluster and namespace a controller set watches
#[derive(Clone)]
pub struct WatchScope {
    pub client: Client,
    /// Registry name of the cluster, used in logs
    pub cluster: String,
    /// `None` watches all namespaces
    pub namespace: Option<String>,
}

impl WatchScope {
    pub fn new(client: Client, cluster: &str, namespace: Option<String>) -> Self {
        Self {
            client,
            cluster: cluster.to_string(),
            namespace,
        }
    }

    pub fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Error policy shared by all controllers: conflicts retry almost
/// immediately, other transient errors wait for the configured backoff and
/// invariant violations wait four times as long.
pub fn error_policy_backoff<K, R: Reconciler>(
    _obj: Arc<K>,
    error: &OperatorError,
    ctx: Arc<R>,
) -> Action {
    let delay = match error {
        OperatorError::Conflict(_) => CONFLICT_REQUEUE,
        e if e.is_transient() => ctx.error_backoff(),
        _ => ctx.error_backoff() * 4,
    };
    debug!(controller = ctx.name(), ?delay, "Requeueing after error");
    Action::requeue(delay)
}

/// Finalizer list with `finalizer` appended, or `None` when already present
pub(crate) fn with_finalizer(current: Option<&[String]>, finalizer: &str) -> Option<Vec<String>> {
    let current = current.unwrap_or_default();
    if current.iter().any(|f| f == finalizer) {
        return None;
    }
    let mut finalizers = current.to_vec();
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list with `finalizer` removed, or `None` when it was absent
pub(crate) fn without_finalizer(
    current: Option<&[String]>,
    finalizer: &str,
) -> Option<Vec<String>> {
    let current = current.unwrap_or_default();
    if !current.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(current.iter().filter(|f| *f != finalizer).cloned().collect())
}
