//! WorkloadDeployment Controller
//!
//! Drives the Instances of a scheduled deployment through the instance
//! management strategy, stages the deployment's network dependencies, lifts
//! the `Network` scheduling gate once they are ready and reports replica
//! counts and availability.

use crate::conditions::{
    build_condition, CONDITION_AVAILABLE, CONDITION_FALSE, CONDITION_TRUE, DEPLOYMENT_FINALIZER,
    INSTANCE_CONDITION_PROGRAMMED,
};
use crate::controllers::{
    error_policy_backoff, with_finalizer, without_finalizer, FinalizeOutcome, Reconciler,
    WatchScope,
};
use crate::crd::{
    Instance, NetworkBinding, Subnet, SubnetClaim, WorkloadDeployment, WorkloadDeploymentStatus,
};
use crate::error::{OperatorError, Result};
use crate::indexers::deployments_at_location;
use crate::instance_control::{compute_hash, strategy_for, NETWORK_SCHEDULING_GATE};
use crate::network::reconcile_networks;
use crate::store::ObjectStore;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Instance counts of a deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaSummary {
    pub replicas: i32,
    /// Programmed with the current template
    pub current: i32,
    pub ready: i32,
}

impl ReplicaSummary {
    pub fn from_instances(instances: &[Instance], template_hash: &str) -> Self {
        let mut summary = Self::default();
        for instance in instances {
            summary.replicas += 1;
            if instance.is_condition_true(INSTANCE_CONDITION_PROGRAMMED)
                && instance.observed_template_hash() == Some(template_hash)
            {
                summary.current += 1;
            }
            if instance.is_ready() {
                summary.ready += 1;
            }
        }
        summary
    }
}

/// Status of a deployment after a reconcile pass.
///
/// `Available` is left untouched when there is nothing to report: no ready
/// instance, networks ready and no instances at all.
pub fn deployment_status(
    deployment: &WorkloadDeployment,
    summary: &ReplicaSummary,
    network_ready: bool,
) -> WorkloadDeploymentStatus {
    let mut status = deployment.status.clone().unwrap_or_default();
    status.replicas = summary.replicas;
    status.current_replicas = summary.current;
    status.ready_replicas = summary.ready;
    status.desired_replicas = deployment.spec.scale_settings.min_replicas;

    let available = if summary.ready > 0 {
        Some((
            CONDITION_TRUE,
            "StableInstanceFound",
            format!("{}/{} instances are ready", summary.ready, summary.replicas),
        ))
    } else if !network_ready {
        Some((
            CONDITION_FALSE,
            "ProvisioningNetwork",
            "Network is being provisioned".to_string(),
        ))
    } else if summary.replicas > 0 {
        Some((
            CONDITION_FALSE,
            "ProvisioningInstances",
            "Instances are being provisioned".to_string(),
        ))
    } else {
        None
    };

    if let Some((condition_status, reason, message)) = available {
        status.conditions.set(Condition {
            observed_generation: deployment.metadata.generation,
            ..build_condition(CONDITION_AVAILABLE, condition_status, reason, &message)
        });
    }
    status
}

/// Reconciles scheduled WorkloadDeployments
pub struct DeploymentReconciler {
    store: Arc<dyn ObjectStore>,
    error_backoff: Duration,
}

impl Reconciler for DeploymentReconciler {
    fn name(&self) -> &'static str {
        "deployment"
    }

    fn error_backoff(&self) -> Duration {
        self.error_backoff
    }
}

impl DeploymentReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, error_backoff: Duration) -> Self {
        Self { store, error_backoff }
    }

    /// Run the deployment controller
    pub async fn run(self: Arc<Self>, scope: WatchScope) -> Result<()> {
        let deployments: Api<WorkloadDeployment> = scope.api();
        let instances: Api<Instance> = scope.api();
        let bindings: Api<NetworkBinding> = scope.api();
        let claims: Api<SubnetClaim> = Api::all(scope.client.clone());
        let subnets: Api<Subnet> = Api::all(scope.client.clone());

        info!(cluster = %scope.cluster, "Starting WorkloadDeployment controller");

        let controller = Controller::new(deployments, Config::default());
        let claim_cache = controller.store();
        let subnet_cache = controller.store();

        controller
            .owns(instances, Config::default())
            .owns(bindings, Config::default())
            .watches(claims, Config::default(), move |claim: SubnetClaim| {
                deployments_at_location(claim_cache.state(), &claim.spec.location.key())
            })
            .watches(subnets, Config::default(), move |subnet: Subnet| {
                deployments_at_location(subnet_cache.state(), &subnet.spec.location.key())
            })
            .shutdown_on_signal()
            .run(
                |deployment, ctx| async move { ctx.reconcile(deployment).await },
                |deployment, error, ctx| {
                    error!("WorkloadDeployment reconciliation error: {:?}", error);
                    error_policy_backoff(deployment, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => debug!("Reconciled deployment: {}", obj.name),
                    Err(e) => error!("WorkloadDeployment reconciliation failed: {:?}", e),
                }
            })
            .await;

        Ok(())
    }

    async fn reconcile(
        &self,
        deployment: Arc<WorkloadDeployment>,
    ) -> std::result::Result<Action, OperatorError> {
        let name = deployment.name_any();
        let namespace = deployment.namespace().unwrap_or_default();

        info!("Reconciling WorkloadDeployment {}/{}", namespace, name);

        let finalizers = deployment.metadata.finalizers.as_deref();

        if deployment.metadata.deletion_timestamp.is_some() {
            let Some(remaining) = without_finalizer(finalizers, DEPLOYMENT_FINALIZER) else {
                return Ok(Action::await_change());
            };
            match self.finalize(&deployment, &namespace).await? {
                FinalizeOutcome::Finalized => {
                    info!(deployment = %name, "Instances removed, releasing finalizer");
                    self.store.set_deployment_finalizers(&deployment, remaining).await?;
                }
                FinalizeOutcome::Blocked(reason) => {
                    debug!(deployment = %name, %reason, "Teardown in progress");
                }
            }
            return Ok(Action::await_change());
        }

        if let Some(updated) = with_finalizer(finalizers, DEPLOYMENT_FINALIZER) {
            self.store.set_deployment_finalizers(&deployment, updated).await?;
            return Ok(Action::await_change());
        }

        if deployment.location().is_none() {
            debug!(deployment = %name, "Deployment has not been scheduled yet");
            return Ok(Action::await_change());
        }

        let uid = deployment_uid(&deployment)?;
        let instances = self.store.list_instances_for_deployment(&namespace, &uid).await?;

        let strategy = strategy_for(deployment.spec.scale_settings.instance_management_policy);
        let actions = strategy.get_actions(&deployment, &instances)?;
        for action in actions.iter().filter(|a| !a.is_skipped()) {
            info!(
                deployment = %name,
                instance = %action.instance_name(),
                action = %action.action_type(),
                "Executing instance action"
            );
            action.execute(self.store.as_ref()).await?;
        }

        let network_ready = reconcile_networks(self.store.as_ref(), &deployment).await?;
        if network_ready {
            self.release_network_gates(&instances).await?;
        }

        let template_hash = compute_hash(&deployment.spec.template)?;
        let summary = ReplicaSummary::from_instances(&instances, &template_hash);
        let status = deployment_status(&deployment, &summary, network_ready);
        if deployment.status.as_ref() != Some(&status) {
            self.store.patch_deployment_status(&deployment, &status).await?;
        }

        Ok(Action::await_change())
    }

    async fn release_network_gates(&self, instances: &[Instance]) -> Result<()> {
        for instance in instances {
            if instance.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let gates = instance.scheduling_gates();
            if !gates.iter().any(|g| g.name == NETWORK_SCHEDULING_GATE) {
                continue;
            }
            let remaining = gates
                .iter()
                .filter(|g| g.name != NETWORK_SCHEDULING_GATE)
                .cloned()
                .collect();
            info!(instance = %instance.name_any(), "Removing network scheduling gate");
            self.store.set_instance_scheduling_gates(instance, remaining).await?;
        }
        Ok(())
    }

    /// Delete the deployment's instances; finished once none remain.
    async fn finalize(
        &self,
        deployment: &WorkloadDeployment,
        namespace: &str,
    ) -> Result<FinalizeOutcome> {
        let uid = deployment_uid(deployment)?;
        let instances = self.store.list_instances_for_deployment(namespace, &uid).await?;
        if instances.is_empty() {
            return Ok(FinalizeOutcome::Finalized);
        }

        for instance in instances.iter().filter(|i| i.metadata.deletion_timestamp.is_none()) {
            info!(instance = %instance.name_any(), "Deleting instance");
            self.store.delete_instance(instance).await?;
        }

        Ok(FinalizeOutcome::Blocked(format!(
            "{} instances remaining",
            instances.len()
        )))
    }
}

fn deployment_uid(deployment: &WorkloadDeployment) -> Result<String> {
    deployment
        .uid()
        .ok_or_else(|| {
            OperatorError::InvalidState(format!("deployment {} has no uid", deployment.name_any()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{
        ConditionSet, INSTANCE_CONDITION_READY, INSTANCE_CONDITION_RUNNING,
    };
    use crate::crd::{
        HorizontalScaleSettings, InstanceController, InstanceControllerStatus, InstanceSpec,
        InstanceStatus, LocationReference, SchedulingGate, WorkloadDeploymentSpec,
        WorkloadReference,
    };
    use crate::store::MockObjectStore;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn deployment(min_replicas: i32) -> WorkloadDeployment {
        let mut deployment = WorkloadDeployment::new(
            "web-us-dfw",
            WorkloadDeploymentSpec {
                workload_ref: WorkloadReference {
                    name: "web".to_string(),
                    uid: "wl-uid".to_string(),
                },
                placement_name: "us".to_string(),
                city_code: "DFW".to_string(),
                scale_settings: HorizontalScaleSettings {
                    min_replicas,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        deployment.metadata.namespace = Some("default".to_string());
        deployment.metadata.uid = Some("dep-uid".to_string());
        deployment.metadata.generation = Some(1);
        deployment.metadata.finalizers = Some(vec![DEPLOYMENT_FINALIZER.to_string()]);
        deployment.status = Some(WorkloadDeploymentStatus {
            location: Some(LocationReference {
                name: "dfw-1".to_string(),
                namespace: "datum-system".to_string(),
            }),
            ..Default::default()
        });
        deployment
    }

    fn instance(name: &str, gated: bool, ready: bool, observed_hash: &str) -> Instance {
        let mut instance = Instance::new(
            name,
            InstanceSpec {
                controller: Some(InstanceController {
                    template_hash: observed_hash.to_string(),
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
        let status = if ready { CONDITION_TRUE } else { CONDITION_FALSE };
        instance.status = Some(InstanceStatus {
            conditions: ConditionSet::from(vec![
                build_condition(INSTANCE_CONDITION_PROGRAMMED, status, "Programmed", ""),
                build_condition(INSTANCE_CONDITION_RUNNING, status, "Running", ""),
                build_condition(INSTANCE_CONDITION_READY, status, "Running", ""),
            ]),
            controller: Some(InstanceControllerStatus {
                observed_template_hash: observed_hash.to_string(),
            }),
            ..Default::default()
        });
        instance
    }

    fn reconciler(store: MockObjectStore) -> DeploymentReconciler {
        DeploymentReconciler::new(Arc::new(store), Duration::from_secs(5))
    }

    #[test]
    fn test_replica_summary() {
        let hash = "current";
        let instances = vec![
            instance("web-us-dfw-0", false, true, hash),
            instance("web-us-dfw-1", false, true, "stale"),
            // matching hash but not programmed yet
            instance("web-us-dfw-2", true, false, hash),
        ];
        assert_eq!(
            ReplicaSummary::from_instances(&instances, hash),
            ReplicaSummary {
                replicas: 3,
                current: 1,
                ready: 2,
            }
        );
    }

    #[test]
    fn test_deployment_status_availability() {
        let dep = deployment(2);

        let status = deployment_status(
            &dep,
            &ReplicaSummary {
                replicas: 2,
                current: 2,
                ready: 1,
            },
            true,
        );
        assert_eq!(status.desired_replicas, 2);
        assert_eq!(status.ready_replicas, 1);
        let available = status.conditions.get(CONDITION_AVAILABLE).unwrap();
        assert_eq!(available.status, CONDITION_TRUE);
        assert_eq!(available.reason, "StableInstanceFound");
        assert_eq!(available.observed_generation, Some(1));

        let status = deployment_status(&dep, &ReplicaSummary::default(), false);
        assert_eq!(
            status.conditions.get(CONDITION_AVAILABLE).unwrap().reason,
            "ProvisioningNetwork"
        );

        let status = deployment_status(
            &dep,
            &ReplicaSummary {
                replicas: 1,
                current: 0,
                ready: 0,
            },
            true,
        );
        assert_eq!(
            status.conditions.get(CONDITION_AVAILABLE).unwrap().reason,
            "ProvisioningInstances"
        );

        let status = deployment_status(&dep, &ReplicaSummary::default(), true);
        assert!(status.conditions.get(CONDITION_AVAILABLE).is_none());
        assert_eq!(status.location, dep.location().cloned());
    }

    #[tokio::test]
    async fn test_fresh_deployment_creates_first_instance() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_instances_for_deployment()
            .withf(|ns, uid| ns == "default" && uid == "dep-uid")
            .returning(|_, _| Ok(vec![]));
        store
            .expect_create_instance()
            .withf(|i| i.name_any() == "web-us-dfw-0")
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_patch_deployment_status()
            .withf(|_, status| status.desired_replicas == 2 && status.replicas == 0)
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconciler(store)
            .reconcile(Arc::new(deployment(2)))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_adds_finalizer_first() {
        let mut dep = deployment(1);
        dep.metadata.finalizers = Some(vec!["other".to_string()]);

        let mut store = MockObjectStore::new();
        store
            .expect_set_deployment_finalizers()
            .withf(|_, f| f == &vec!["other".to_string(), DEPLOYMENT_FINALIZER.to_string()])
            .times(1)
            .returning(|_, _| Ok(()));

        reconciler(store).reconcile(Arc::new(dep)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unscheduled_deployment_waits() {
        let mut dep = deployment(1);
        dep.status = None;

        let action = reconciler(MockObjectStore::new())
            .reconcile(Arc::new(dep))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_network_ready_lifts_gate() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_instances_for_deployment()
            .returning(|_, _| Ok(vec![instance("web-us-dfw-0", true, false, "")]));
        store
            .expect_set_instance_scheduling_gates()
            .withf(|i, gates| i.name_any() == "web-us-dfw-0" && gates.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_patch_deployment_status()
            .withf(|_, status| {
                status.replicas == 1
                    && status.ready_replicas == 0
                    && status
                        .conditions
                        .get(CONDITION_AVAILABLE)
                        .is_some_and(|c| c.reason == "ProvisioningInstances")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconciler(store)
            .reconcile(Arc::new(deployment(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_action_failure_aborts_pass() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_instances_for_deployment()
            .returning(|_, _| Ok(vec![]));
        store
            .expect_create_instance()
            .times(1)
            .returning(|_| Err(OperatorError::Conflict("already exists".into())));

        let err = reconciler(store)
            .reconcile(Arc::new(deployment(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_teardown_blocks_until_instances_gone() {
        let mut dep = deployment(2);
        dep.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut deleting = instance("web-us-dfw-1", false, true, "");
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut store = MockObjectStore::new();
        store
            .expect_list_instances_for_deployment()
            .returning(move |_, _| {
                Ok(vec![instance("web-us-dfw-0", false, true, ""), deleting.clone()])
            });
        store
            .expect_delete_instance()
            .withf(|i| i.name_any() == "web-us-dfw-0")
            .times(1)
            .returning(|_| Ok(()));

        let action = reconciler(store).reconcile(Arc::new(dep)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_teardown_releases_finalizer() {
        let mut dep = deployment(2);
        dep.metadata.deletion_timestamp = Some(Time(Utc::now()));
        dep.metadata.finalizers = Some(vec!["other".to_string(), DEPLOYMENT_FINALIZER.to_string()]);

        let mut store = MockObjectStore::new();
        store
            .expect_list_instances_for_deployment()
            .returning(|_, _| Ok(vec![]));
        store
            .expect_set_deployment_finalizers()
            .withf(|_, f| f == &vec!["other".to_string()])
            .times(1)
            .returning(|_, _| Ok(()));

        reconciler(store).reconcile(Arc::new(dep)).await.unwrap();
    }
}
