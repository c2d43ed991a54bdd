//! Workload Controller
//!
//! Expands every placement of a Workload into one WorkloadDeployment per
//! city code served by a registered Location, removes deployments that are no
//! longer wanted and aggregates their status back onto the Workload.

use crate::conditions::{
    build_condition, CONDITION_AVAILABLE, CONDITION_FALSE, CONDITION_TRUE, DEPLOYMENT_FINALIZER,
    WORKLOAD_FINALIZER,
};
use crate::controllers::{
    error_policy_backoff, with_finalizer, without_finalizer, FinalizeOutcome, Reconciler,
    WatchScope,
};
use crate::crd::{
    Location, Network, Workload, WorkloadDeployment, WorkloadDeploymentSpec,
    WorkloadPlacementStatus, WorkloadReference, WorkloadStatus, WORKLOAD_UID_LABEL,
};
use crate::error::{OperatorError, Result};
use crate::indexers::{object_key, workload_networks_index, workloads_using_network};
use crate::store::ObjectStore;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Name of the deployment for one placement and city code
pub fn deployment_name(workload: &str, placement: &str, city_code: &str) -> String {
    format!("{}-{}-{}", workload, placement, city_code.to_lowercase())
}

/// Deployments the workload should have, given the registered Locations.
///
/// City codes no Location serves are skipped.
pub fn desired_deployments(
    workload: &Workload,
    locations: &[Location],
) -> Result<Vec<WorkloadDeployment>> {
    let uid = workload
        .uid()
        .ok_or_else(|| {
            OperatorError::InvalidState(format!("workload {} has no uid", workload.name_any()))
        })?;
    let owner = workload.controller_owner_ref(&()).ok_or_else(|| {
        OperatorError::InvalidState(format!(
            "cannot build owner reference for workload {}",
            workload.name_any()
        ))
    })?;
    let served: BTreeSet<&str> = locations.iter().filter_map(Location::city_code).collect();

    let mut deployments = Vec::new();
    for placement in &workload.spec.placements {
        for city_code in placement.city_codes.iter().filter(|c| served.contains(c.as_str())) {
            let mut deployment = WorkloadDeployment::new(
                &deployment_name(&workload.name_any(), &placement.name, city_code),
                WorkloadDeploymentSpec {
                    workload_ref: WorkloadReference {
                        name: workload.name_any(),
                        uid: uid.clone(),
                    },
                    placement_name: placement.name.clone(),
                    city_code: city_code.clone(),
                    template: workload.spec.template.clone(),
                    scale_settings: placement.scale_settings.clone(),
                },
            );
            deployment.metadata.namespace = workload.namespace();
            deployment.metadata.labels = Some(BTreeMap::from([(
                WORKLOAD_UID_LABEL.to_string(),
                uid.clone(),
            )]));
            deployment.metadata.owner_references = Some(vec![owner.clone()]);
            deployment.metadata.finalizers = Some(vec![DEPLOYMENT_FINALIZER.to_string()]);
            deployments.push(deployment);
        }
    }
    Ok(deployments)
}

/// Workload status aggregated from its deployments.
///
/// Placement conditions and the gateway status carry over from the previous
/// status; counts are recomputed.
pub fn aggregate_status(workload: &Workload, deployments: &[WorkloadDeployment]) -> WorkloadStatus {
    let previous = workload.status.clone().unwrap_or_default();
    let generation = workload.metadata.generation;

    let mut by_placement: BTreeMap<&str, Vec<&WorkloadDeployment>> = BTreeMap::new();
    for deployment in deployments {
        by_placement
            .entry(deployment.spec.placement_name.as_str())
            .or_default()
            .push(deployment);
    }

    let mut status = WorkloadStatus {
        conditions: previous.conditions.clone(),
        gateway: previous.gateway.clone(),
        ..Default::default()
    };
    let mut any_placement_available = false;

    for (name, members) in by_placement {
        let mut placement = previous
            .placements
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .unwrap_or_else(|| WorkloadPlacementStatus {
                name: name.to_string(),
                ..Default::default()
            });
        placement.replicas = 0;
        placement.current_replicas = 0;
        placement.desired_replicas = 0;
        placement.ready_replicas = 0;

        for deployment in &members {
            if let Some(s) = &deployment.status {
                placement.replicas += s.replicas;
                placement.current_replicas += s.current_replicas;
                placement.desired_replicas += s.desired_replicas;
                placement.ready_replicas += s.ready_replicas;
            }
        }

        let available = members.iter().any(|d| d.is_available());
        any_placement_available |= available;
        let (condition_status, reason, message) = if available {
            (CONDITION_TRUE, "AvailableDeploymentFound", "At least one deployment is available")
        } else {
            (CONDITION_FALSE, "NoAvailableDeployments", "No available deployments were found")
        };
        placement.conditions.set(Condition {
            observed_generation: generation,
            ..build_condition(CONDITION_AVAILABLE, condition_status, reason, message)
        });

        status.replicas += placement.replicas;
        status.current_replicas += placement.current_replicas;
        status.desired_replicas += placement.desired_replicas;
        status.ready_replicas += placement.ready_replicas;
        status.placements.push(placement);
    }

    let (condition_status, reason, message) = if any_placement_available {
        (CONDITION_TRUE, "AvailablePlacementFound", "At least one placement is available")
    } else {
        (CONDITION_FALSE, "NoAvailablePlacements", "No available placements were found")
    };
    status.conditions.set(Condition {
        observed_generation: generation,
        ..build_condition(CONDITION_AVAILABLE, condition_status, reason, message)
    });

    status
}

/// Reconciles Workloads into WorkloadDeployments
pub struct WorkloadReconciler {
    store: Arc<dyn ObjectStore>,
    error_backoff: Duration,
}

impl Reconciler for WorkloadReconciler {
    fn name(&self) -> &'static str {
        "workload"
    }

    fn error_backoff(&self) -> Duration {
        self.error_backoff
    }
}

impl WorkloadReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, error_backoff: Duration) -> Self {
        Self { store, error_backoff }
    }

    /// Run the workload controller
    ///
    /// Network changes re-trigger the workloads referencing them; Location
    /// changes re-trigger every workload.
    pub async fn run(self: Arc<Self>, scope: WatchScope) -> Result<()> {
        let workloads: Api<Workload> = scope.api();
        let deployments: Api<WorkloadDeployment> = scope.api();
        let networks: Api<Network> = Api::all(scope.client.clone());
        let locations: Api<Location> = Api::all(scope.client.clone());

        info!(cluster = %scope.cluster, "Starting Workload controller");

        let controller = Controller::new(workloads, Config::default());
        let network_cache = controller.store();
        let location_cache = controller.store();

        controller
            .owns(deployments, Config::default())
            .watches(networks, Config::default(), move |network: Network| {
                workloads_using_network(network_cache.state(), &object_key(&network))
            })
            .watches(locations, Config::default(), move |_location: Location| {
                location_cache
                    .state()
                    .into_iter()
                    .map(|w| ObjectRef::from_obj(&*w))
                    .collect::<Vec<_>>()
            })
            .shutdown_on_signal()
            .run(
                |workload, ctx| async move { ctx.reconcile(workload).await },
                |workload, error, ctx| {
                    error!("Workload reconciliation error: {:?}", error);
                    error_policy_backoff(workload, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => debug!("Reconciled workload: {}", obj.name),
                    Err(e) => error!("Workload reconciliation failed: {:?}", e),
                }
            })
            .await;

        Ok(())
    }

    async fn reconcile(
        &self,
        workload: Arc<Workload>,
    ) -> std::result::Result<Action, OperatorError> {
        let name = workload.name_any();
        let namespace = workload.namespace().unwrap_or_default();

        info!("Reconciling Workload {}/{}", namespace, name);

        let finalizers = workload.metadata.finalizers.as_deref();

        if workload.metadata.deletion_timestamp.is_some() {
            let Some(remaining) = without_finalizer(finalizers, WORKLOAD_FINALIZER) else {
                return Ok(Action::await_change());
            };
            match self.finalize(&workload, &namespace).await? {
                FinalizeOutcome::Finalized => {
                    info!(workload = %name, "Deployments removed, releasing finalizer");
                    self.store.set_workload_finalizers(&workload, remaining).await?;
                }
                FinalizeOutcome::Blocked(reason) => {
                    debug!(workload = %name, %reason, "Teardown in progress");
                }
            }
            return Ok(Action::await_change());
        }

        if let Some(updated) = with_finalizer(finalizers, WORKLOAD_FINALIZER) {
            self.store.set_workload_finalizers(&workload, updated).await?;
            return Ok(Action::await_change());
        }

        let missing = self.missing_networks(&workload).await?;
        if !missing.is_empty() {
            warn!(workload = %name, networks = ?missing, "Referenced networks not found");
            let message = format!("Unable to find networks: {}", missing.join(", "));
            self.set_unavailable(&workload, "NetworkNotFound", &message).await?;
            return Ok(Action::await_change());
        }

        let locations = self.store.list_locations().await?;
        if locations.is_empty() {
            self.set_unavailable(
                &workload,
                "NoLocations",
                "No locations are registered with the system.",
            )
            .await?;
            return Ok(Action::await_change());
        }

        let uid = workload.uid().unwrap_or_default();
        let desired = desired_deployments(&workload, &locations)?;
        let desired_names: BTreeSet<String> = desired.iter().map(|d| d.name_any()).collect();

        let existing: Vec<WorkloadDeployment> = self
            .store
            .list_deployments_for_workload(&namespace, &uid)
            .await?
            .into_iter()
            .filter(|d| d.spec.workload_ref.uid == uid)
            .collect();

        let mut current: BTreeMap<String, WorkloadDeployment> = BTreeMap::new();
        for deployment in existing {
            if !desired_names.contains(&deployment.name_any())
                && deployment.metadata.deletion_timestamp.is_none()
            {
                info!(
                    workload = %name,
                    deployment = %deployment.name_any(),
                    "Deleting orphaned deployment"
                );
                self.store.delete_deployment(&deployment).await?;
            }
            current.insert(deployment.name_any(), deployment);
        }

        for deployment in desired {
            let upserted = self.upsert_deployment(&namespace, deployment).await?;
            current.insert(upserted.name_any(), upserted);
        }

        let deployments: Vec<WorkloadDeployment> = current.into_values().collect();
        let status = aggregate_status(&workload, &deployments);
        if workload.status.as_ref() != Some(&status) {
            self.store.patch_workload_status(&workload, &status).await?;
        }

        Ok(Action::await_change())
    }

    /// Create the deployment, or bring an existing one's spec up to date.
    /// Status and other metadata of an existing deployment are preserved.
    async fn upsert_deployment(
        &self,
        namespace: &str,
        desired: WorkloadDeployment,
    ) -> Result<WorkloadDeployment> {
        let name = desired.name_any();
        let Some(existing) = self.store.get_deployment(namespace, &name).await? else {
            info!(deployment = %name, "Creating deployment");
            return self.store.create_deployment(&desired).await;
        };

        if existing.metadata.deletion_timestamp.is_some() || existing.spec == desired.spec {
            return Ok(existing);
        }

        info!(deployment = %name, "Updating deployment");
        let workload_uid = desired.spec.workload_ref.uid.clone();
        let mut updated = existing;
        updated.spec = desired.spec;
        updated
            .labels_mut()
            .insert(WORKLOAD_UID_LABEL.to_string(), workload_uid);
        self.store.replace_deployment(&updated).await
    }

    /// Referenced networks that do not exist, as `namespace/name`
    async fn missing_networks(&self, workload: &Workload) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for key in workload_networks_index(workload) {
            let Some((namespace, network)) = key.split_once('/') else {
                continue;
            };
            if self.store.get_network(namespace, network).await?.is_none() {
                missing.push(key.clone());
            }
        }
        Ok(missing)
    }

    async fn set_unavailable(
        &self,
        workload: &Workload,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let mut status = workload.status.clone().unwrap_or_default();
        let changed = status.conditions.set(Condition {
            observed_generation: workload.metadata.generation,
            ..build_condition(CONDITION_AVAILABLE, CONDITION_FALSE, reason, message)
        });
        if changed {
            self.store.patch_workload_status(workload, &status).await?;
        }
        Ok(())
    }

    /// Delete the workload's deployments; finished once none remain.
    async fn finalize(&self, workload: &Workload, namespace: &str) -> Result<FinalizeOutcome> {
        let uid = workload.uid().unwrap_or_default();
        let deployments: Vec<WorkloadDeployment> = self
            .store
            .list_deployments_for_workload(namespace, &uid)
            .await?
            .into_iter()
            .filter(|d| d.spec.workload_ref.uid == uid)
            .collect();
        if deployments.is_empty() {
            return Ok(FinalizeOutcome::Finalized);
        }

        for deployment in deployments.iter().filter(|d| d.metadata.deletion_timestamp.is_none()) {
            info!(deployment = %deployment.name_any(), "Deleting deployment");
            self.store.delete_deployment(deployment).await?;
        }

        Ok(FinalizeOutcome::Blocked(format!(
            "{} deployments remaining",
            deployments.len()
        )))
    }
}
