//! Instance Controller
//!
//! Derives the `Ready` condition of every Instance from its scheduling gates
//! and the `Programmed` and `Running` conditions reported by the runtime.

use crate::conditions::{
    build_condition, CONDITION_FALSE, CONDITION_TRUE, CONDITION_UNKNOWN,
    INSTANCE_CONDITION_PROGRAMMED, INSTANCE_CONDITION_READY, INSTANCE_CONDITION_RUNNING,
    NETWORK_CONDITION_READY,
};
use crate::controllers::{error_policy_backoff, Reconciler, WatchScope};
use crate::crd::{Instance, WorkloadDeployment};
use crate::error::{OperatorError, Result};
use crate::network::network_binding_name;
use crate::store::ObjectStore;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Reason reported by a NetworkBinding whose network could not be created
pub const REASON_NETWORK_FAILED_TO_CREATE: &str = "NetworkFailedToCreate";

const REASON_SCHEDULING_GATES_PRESENT: &str = "SchedulingGatesPresent";
const REASON_PENDING_PROGRAMMING: &str = "PendingProgramming";
const REASON_PENDING: &str = "Pending";
const REASON_RUNNING: &str = "Running";

/// Reconciles the `Ready` condition of Instances
pub struct InstanceReconciler {
    store: Arc<dyn ObjectStore>,
    error_backoff: Duration,
}

impl Reconciler for InstanceReconciler {
    fn name(&self) -> &'static str {
        "instance"
    }

    fn error_backoff(&self) -> Duration {
        self.error_backoff
    }
}

impl InstanceReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, error_backoff: Duration) -> Self {
        Self { store, error_backoff }
    }

    /// Run the instance controller
    pub async fn run(self: Arc<Self>, scope: WatchScope) -> Result<()> {
        let instances: Api<Instance> = scope.api();

        info!(cluster = %scope.cluster, "Starting Instance controller");

        Controller::new(instances, Config::default())
            .shutdown_on_signal()
            .run(
                |instance, ctx| async move { ctx.reconcile(instance).await },
                |instance, error, ctx| {
                    error!("Instance reconciliation error: {:?}", error);
                    error_policy_backoff(instance, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => debug!("Reconciled instance: {}", obj.name),
                    Err(e) => error!("Instance reconciliation failed: {:?}", e),
                }
            })
            .await;

        Ok(())
    }

    async fn reconcile(
        &self,
        instance: Arc<Instance>,
    ) -> std::result::Result<Action, OperatorError> {
        if instance.metadata.deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        debug!(
            "Reconciling Instance {}/{}",
            instance.namespace().unwrap_or_default(),
            instance.name_any()
        );

        let network_failure = if instance.scheduling_gates().is_empty() {
            None
        } else {
            self.network_failure(&instance).await?
        };

        let mut status = instance.status.clone().unwrap_or_default();
        let ready = ready_condition(&instance, network_failure.as_deref());
        if status.conditions.set(ready) {
            info!(
                instance = %instance.name_any(),
                ready = instance_ready_status(&status.conditions),
                "Updating instance ready condition"
            );
            self.store.patch_instance_status(&instance, &status).await?;
        }

        Ok(Action::await_change())
    }

    /// Message of the first network binding of the instance's deployment that
    /// failed to create its network.
    async fn network_failure(&self, instance: &Instance) -> Result<Option<String>> {
        let owner = instance
            .owner_references()
            .iter()
            .find(|o| o.controller == Some(true) && o.kind == WorkloadDeployment::kind(&()))
            .ok_or_else(|| {
                OperatorError::InvalidState(format!(
                    "instance {} has no controlling WorkloadDeployment",
                    instance.name_any()
                ))
            })?;
        let namespace = instance.namespace().unwrap_or_default();

        let deployment = self
            .store
            .get_deployment(&namespace, &owner.name)
            .await?
            .ok_or_else(|| {
                OperatorError::NotFound(format!("WorkloadDeployment {}/{}", namespace, owner.name))
            })?;

        for index in 0..deployment.spec.template.spec.network_interfaces.len() {
            let name = network_binding_name(&deployment.name_any(), index);
            let Some(binding) = self.store.get_network_binding(&namespace, &name).await? else {
                continue;
            };
            let failed = binding
                .status
                .as_ref()
                .and_then(|s| s.conditions.get(NETWORK_CONDITION_READY))
                .filter(|c| {
                    c.status == CONDITION_FALSE && c.reason == REASON_NETWORK_FAILED_TO_CREATE
                });
            if let Some(condition) = failed {
                return Ok(Some(condition.message.clone()));
            }
        }

        Ok(None)
    }
}

fn instance_ready_status(conditions: &crate::conditions::ConditionSet) -> &str {
    conditions
        .get(INSTANCE_CONDITION_READY)
        .map_or(CONDITION_UNKNOWN, |c| c.status.as_str())
}

/// Compute the `Ready` condition of an instance.
///
/// `network_failure` carries the message of a network binding that failed to
/// create its network, if any; it is only consulted while scheduling gates
/// are present.
pub fn ready_condition(instance: &Instance, network_failure: Option<&str>) -> Condition {
    let conditions = instance.status.as_ref().map(|s| &s.conditions);
    let programmed = conditions.and_then(|c| c.get(INSTANCE_CONDITION_PROGRAMMED));
    let running = conditions.and_then(|c| c.get(INSTANCE_CONDITION_RUNNING));

    let (status, reason, message) = if !instance.scheduling_gates().is_empty() {
        match network_failure {
            Some(message) => (
                CONDITION_FALSE,
                REASON_NETWORK_FAILED_TO_CREATE,
                message.to_string(),
            ),
            None => {
                let names: Vec<&str> = instance
                    .scheduling_gates()
                    .iter()
                    .map(|g| g.name.as_str())
                    .collect();
                (
                    CONDITION_FALSE,
                    REASON_SCHEDULING_GATES_PRESENT,
                    format!("Scheduling gates present: {}", names.join(", ")),
                )
            }
        }
    } else if !programmed.is_some_and(|c| c.status == CONDITION_TRUE) {
        let (reason, message) = carried_over(
            programmed,
            REASON_PENDING_PROGRAMMING,
            "Instance has not been programmed",
        );
        (CONDITION_FALSE, reason, message)
    } else if !running.is_some_and(|c| c.status == CONDITION_TRUE) {
        let (reason, message) = carried_over(running, REASON_PENDING, "Instance is not running");
        (CONDITION_FALSE, reason, message)
    } else {
        (CONDITION_TRUE, REASON_RUNNING, "Instance is ready".to_string())
    };

    Condition {
        observed_generation: instance.metadata.generation,
        ..build_condition(INSTANCE_CONDITION_READY, status, reason, &message)
    }
}

/// Reason and message taken from a runtime condition, with defaults for
/// missing or still-pending ones.
fn carried_over<'a>(
    source: Option<&'a Condition>,
    default_reason: &'a str,
    default_message: &str) -> (&'a str, String,
) {
    let reason = source
        .map(|c| c.reason.as_str())
        .filter(|r| !r.is_empty() && *r != REASON_PENDING)
        .unwrap_or(default_reason);
    let message = source
        .filter(|c| c.status != CONDITION_UNKNOWN && !c.message.is_empty())
        .map_or_else(|| default_message.to_string(), |c| c.message.clone());
    (reason, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ConditionSet;
    use crate::crd::{
        InstanceController, InstanceNetworkInterface, InstanceSpec, InstanceStatus, NetworkBinding,
        NetworkBindingSpec, NetworkBindingStatus, NetworkRef, SchedulingGate,
        WorkloadDeploymentSpec,
    };
    use crate::instance_control::NETWORK_SCHEDULING_GATE;
    use crate::store::MockObjectStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn instance(gated: bool, conditions: Vec<Condition>) -> Instance {
        let mut instance = Instance::new(
            "web-0",
            InstanceSpec {
                controller: Some(InstanceController {
                    template_hash: "abc".to_string(),
                    scheduling_gates: if gated {
                        vec![SchedulingGate {
                            name: NETWORK_SCHEDULING_GATE.to_string(),
                        }]
                    } else {
                        Vec::new()
                    },
                }),
                ..Default::default()
            },
        );
        instance.metadata.namespace = Some("default".to_string());
        instance.metadata.generation = Some(3);
        instance.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "compute.datumapis.com/v1alpha".to_string(),
            kind: "WorkloadDeployment".to_string(),
            name: "web-us-dfw".to_string(),
            uid: "dep-uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        instance.status = Some(InstanceStatus {
            conditions: ConditionSet::from(conditions),
            ..Default::default()
        });
        instance
    }

    fn condition(type_: &str, status: &str, reason: &str, message: &str) -> Condition {
        build_condition(type_, status, reason, message)
    }

    #[test]
    fn test_ready_when_gated() {
        let ready = ready_condition(&instance(true, vec![]), None);
        assert_eq!(ready.type_, INSTANCE_CONDITION_READY);
        assert_eq!(ready.status, CONDITION_FALSE);
        assert_eq!(ready.reason, REASON_SCHEDULING_GATES_PRESENT);
        assert_eq!(ready.message, "Scheduling gates present: Network");
        assert_eq!(ready.observed_generation, Some(3));
    }

    #[test]
    fn test_ready_propagates_network_failure() {
        let ready = ready_condition(&instance(true, vec![]), Some("quota exceeded"));
        assert_eq!(ready.status, CONDITION_FALSE);
        assert_eq!(ready.reason, REASON_NETWORK_FAILED_TO_CREATE);
        assert_eq!(ready.message, "quota exceeded");
    }

    #[test]
    fn test_ready_pending_programming() {
        let ready = ready_condition(&instance(false, vec![]), None);
        assert_eq!(ready.status, CONDITION_FALSE);
        assert_eq!(ready.reason, REASON_PENDING_PROGRAMMING);
        assert_eq!(ready.message, "Instance has not been programmed");

        // A "Pending" reason from the runtime keeps the default reason
        let ready = ready_condition(
            &instance(
                false,
                vec![condition(
                    INSTANCE_CONDITION_PROGRAMMED,
                    CONDITION_FALSE,
                    "Pending",
                    "queued",
                )],
            ),
            None,
        );
        assert_eq!(ready.reason, REASON_PENDING_PROGRAMMING);
        assert_eq!(ready.message, "queued");
    }

    #[test]
    fn test_ready_copies_programmed_failure() {
        let ready = ready_condition(
            &instance(
                false,
                vec![condition(
                    INSTANCE_CONDITION_PROGRAMMED,
                    CONDITION_FALSE,
                    "ImagePullFailed",
                    "image not found",
                )],
            ),
            None,
        );
        assert_eq!(ready.reason, "ImagePullFailed");
        assert_eq!(ready.message, "image not found");

        // Unknown status keeps the default message
        let ready = ready_condition(
            &instance(
                false,
                vec![condition(
                    INSTANCE_CONDITION_PROGRAMMED,
                    CONDITION_UNKNOWN,
                    "Syncing",
                    "working",
                )],
            ),
            None,
        );
        assert_eq!(ready.reason, "Syncing");
        assert_eq!(ready.message, "Instance has not been programmed");
    }

    #[test]
    fn test_ready_waits_for_running() {
        let ready = ready_condition(
            &instance(
                false,
                vec![condition(INSTANCE_CONDITION_PROGRAMMED, CONDITION_TRUE, "Programmed", "")],
            ),
            None,
        );
        assert_eq!(ready.status, CONDITION_FALSE);
        assert_eq!(ready.reason, REASON_PENDING);
        assert_eq!(ready.message, "Instance is not running");

        let ready = ready_condition(
            &instance(
                false,
                vec![
                    condition(INSTANCE_CONDITION_PROGRAMMED, CONDITION_TRUE, "Programmed", ""),
                    condition(INSTANCE_CONDITION_RUNNING, CONDITION_FALSE, "CrashLoop", "exited 1"),
                ],
            ),
            None,
        );
        assert_eq!(ready.reason, "CrashLoop");
        assert_eq!(ready.message, "exited 1");
    }

    #[test]
    fn test_ready_when_running() {
        let ready = ready_condition(
            &instance(
                false,
                vec![
                    condition(INSTANCE_CONDITION_PROGRAMMED, CONDITION_TRUE, "Programmed", ""),
                    condition(INSTANCE_CONDITION_RUNNING, CONDITION_TRUE, "Running", ""),
                ],
            ),
            None,
        );
        assert_eq!(ready.status, CONDITION_TRUE);
        assert_eq!(ready.reason, REASON_RUNNING);
    }

    fn deployment_with_interface() -> WorkloadDeployment {
        let mut spec = WorkloadDeploymentSpec::default();
        spec.template.spec.network_interfaces = vec![InstanceNetworkInterface {
            network: NetworkRef {
                name: "default".to_string(),
                namespace: None,
            },
            ..Default::default()
        }];
        let mut deployment = WorkloadDeployment::new("web-us-dfw", spec);
        deployment.metadata.namespace = Some("default".to_string());
        deployment
    }

    fn failed_binding() -> NetworkBinding {
        let mut binding = NetworkBinding::new("web-us-dfw-net-0", NetworkBindingSpec::default());
        binding.status = Some(NetworkBindingStatus {
            conditions: ConditionSet::from(vec![condition(
                NETWORK_CONDITION_READY,
                CONDITION_FALSE,
                REASON_NETWORK_FAILED_TO_CREATE,
                "subnet range exhausted",
            )]),
            ..Default::default()
        });
        binding
    }

    #[tokio::test]
    async fn test_reconcile_reports_network_failure() {
        let mut store = MockObjectStore::new();
        store
            .expect_get_deployment()
            .withf(|ns, name| ns == "default" && name == "web-us-dfw")
            .returning(|_, _| Ok(Some(deployment_with_interface())));
        store
            .expect_get_network_binding()
            .withf(|_, name| name == "web-us-dfw-net-0")
            .returning(|_, _| Ok(Some(failed_binding())));
        store
            .expect_patch_instance_status()
            .withf(|_, status| {
                status.conditions.get(INSTANCE_CONDITION_READY).is_some_and(|c| {
                    c.reason == REASON_NETWORK_FAILED_TO_CREATE
                        && c.message == "subnet range exhausted"
                })
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let reconciler = InstanceReconciler::new(Arc::new(store), Duration::from_secs(5));
        let action = reconciler.reconcile(Arc::new(instance(true, vec![]))).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_reconcile_skips_unchanged_status() {
        let existing = ready_condition(&instance(false, vec![]), None);
        let store = MockObjectStore::new();

        let reconciler = InstanceReconciler::new(Arc::new(store), Duration::from_secs(5));
        reconciler
            .reconcile(Arc::new(instance(false, vec![existing])))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_requires_controller_owner() {
        let store = MockObjectStore::new();
        let mut orphan = instance(true, vec![]);
        orphan.metadata.owner_references = None;

        let reconciler = InstanceReconciler::new(Arc::new(store), Duration::from_secs(5));
        let err = reconciler.reconcile(Arc::new(orphan)).await.unwrap_err();
        assert!(matches!(err, OperatorError::InvalidState(_)));
    }
}
