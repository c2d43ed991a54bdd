//! Deployment Scheduler
//!
//! Assigns each unscheduled WorkloadDeployment to the first Location whose
//! city code matches. The assignment is never revisited once made.

use crate::conditions::{build_condition, CONDITION_AVAILABLE, CONDITION_FALSE};
use crate::controllers::{error_policy_backoff, Reconciler, WatchScope};
use crate::crd::{Location, LocationReference, WorkloadDeployment};
use crate::error::{OperatorError, Result};
use crate::store::ObjectStore;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Requeue delay while no Location is registered at all
pub const NO_LOCATIONS_REQUEUE: Duration = Duration::from_secs(30);

const REASON_NO_LOCATIONS: &str = "NoLocations";
const REASON_NO_CANDIDATE_LOCATIONS: &str = "NoCandidateLocations";
const REASON_LOCATION_ASSIGNED: &str = "LocationAssigned";

/// Result of matching a deployment against the registered Locations
#[derive(Debug, PartialEq)]
pub enum LocationSelection<'a> {
    NoLocations,
    NoCandidates,
    Selected(&'a Location),
}

/// First Location, in listing order, serving the deployment's city code
pub fn select_location<'a>(
    deployment: &WorkloadDeployment,
    locations: &'a [Location],
) -> LocationSelection<'a> {
    if locations.is_empty() {
        return LocationSelection::NoLocations;
    }
    locations
        .iter()
        .find(|l| l.city_code() == Some(deployment.spec.city_code.as_str()))
        .map_or(LocationSelection::NoCandidates, LocationSelection::Selected)
}

/// Schedules WorkloadDeployments onto Locations
pub struct DeploymentScheduler {
    store: Arc<dyn ObjectStore>,
    error_backoff: Duration,
}

impl Reconciler for DeploymentScheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn error_backoff(&self) -> Duration {
        self.error_backoff
    }
}

impl DeploymentScheduler {
    pub fn new(store: Arc<dyn ObjectStore>, error_backoff: Duration) -> Self {
        Self { store, error_backoff }
    }

    /// Run the scheduler
    ///
    /// Any Location change re-triggers every deployment still waiting for a
    /// location.
    pub async fn run(self: Arc<Self>, scope: WatchScope) -> Result<()> {
        let deployments: Api<WorkloadDeployment> = scope.api();
        let locations: Api<Location> = Api::all(scope.client.clone());

        info!(cluster = %scope.cluster, "Starting WorkloadDeployment scheduler");

        let controller = Controller::new(deployments, Config::default());
        let cache = controller.store();

        controller
            .watches(locations, Config::default(), move |_location| {
                cache
                    .state()
                    .into_iter()
                    .filter(|d| d.location().is_none())
                    .map(|d| ObjectRef::from_obj(&*d))
                    .collect::<Vec<_>>()
            })
            .shutdown_on_signal()
            .run(
                |deployment, ctx| async move { ctx.reconcile(deployment).await },
                |deployment, error, ctx| {
                    error!("Scheduling error: {:?}", error);
                    error_policy_backoff(deployment, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                if let Err(e) = result {
                    error!("Scheduling failed: {:?}", e);
                }
            })
            .await;

        Ok(())
    }

    async fn reconcile(
        &self,
        deployment: Arc<WorkloadDeployment>,
    ) -> std::result::Result<Action, OperatorError> {
        if deployment.metadata.deletion_timestamp.is_some() || deployment.location().is_some() {
            return Ok(Action::await_change());
        }

        let name = deployment.name_any();
        debug!(
            "Scheduling WorkloadDeployment {}/{}",
            deployment.namespace().unwrap_or_default(),
            name
        );

        let locations = self.store.list_locations().await?;
        let mut status = deployment.status.clone().unwrap_or_default();

        match select_location(&deployment, &locations) {
            LocationSelection::NoLocations => {
                let condition = available_false(
                    &deployment,
                    REASON_NO_LOCATIONS,
                    "No locations are registered with the system.",
                );
                if status.conditions.set(condition) {
                    self.store.patch_deployment_status(&deployment, &status).await?;
                }
                Ok(Action::requeue(NO_LOCATIONS_REQUEUE))
            }
            LocationSelection::NoCandidates => {
                let condition = available_false(
                    &deployment,
                    REASON_NO_CANDIDATE_LOCATIONS,
                    "No locations are candidates for this deployment.",
                );
                if status.conditions.set(condition) {
                    debug!(
                        deployment = %name,
                        city_code = %deployment.spec.city_code,
                        "No candidate locations"
                    );
                    self.store.patch_deployment_status(&deployment, &status).await?;
                }
                Ok(Action::await_change())
            }
            LocationSelection::Selected(location) => {
                let location_ref = LocationReference {
                    name: location.name_any(),
                    namespace: location.namespace().unwrap_or_default(),
                };
                info!(
                    deployment = %name,
                    location = %location_ref.key(),
                    "Assigning deployment to location"
                );

                status.location = Some(location_ref);
                status.cluster_ref = location.spec.provider.cluster.clone();
                status.conditions.set(available_false(
                    &deployment,
                    REASON_LOCATION_ASSIGNED,
                    "Deployment has been assigned a location.",
                ));
                self.store.patch_deployment_status(&deployment, &status).await?;
                Ok(Action::await_change())
            }
        }
    }
}

fn available_false(deployment: &WorkloadDeployment, reason: &str, message: &str) -> Condition {
    Condition {
        observed_generation: deployment.metadata.generation,
        ..build_condition(CONDITION_AVAILABLE, CONDITION_FALSE, reason, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ClusterReference, LocationProvider, LocationSpec, WorkloadDeploymentSpec,
        CITY_CODE_TOPOLOGY_KEY,
    };
    use crate::store::MockObjectStore;
    use std::collections::BTreeMap;

    fn location(name: &str, city: &str) -> Location {
        let mut location = Location::new(
            name,
            LocationSpec {
                topology: BTreeMap::from([(CITY_CODE_TOPOLOGY_KEY.to_string(), city.to_string())]),
                provider: LocationProvider {
                    cluster: Some(ClusterReference {
                        name: format!("{}-cluster", name),
                    }),
                    gcp: None,
                },
                ..Default::default()
            },
        );
        location.metadata.namespace = Some("datum-system".to_string());
        location
    }

    fn deployment(city: &str) -> WorkloadDeployment {
        let mut deployment = WorkloadDeployment::new(
            "web-us-dfw",
            WorkloadDeploymentSpec {
                city_code: city.to_string(),
                ..Default::default()
            },
        );
        deployment.metadata.namespace = Some("default".to_string());
        deployment
    }

    #[test]
    fn test_select_location() {
        let locations = vec![
            location("lax-1", "LAX"),
            location("dfw-1", "DFW"),
            location("dfw-2", "DFW"),
        ];

        match select_location(&deployment("DFW"), &locations) {
            LocationSelection::Selected(l) => assert_eq!(l.name_any(), "dfw-1"),
            other => panic!("unexpected selection: {:?}", other),
        }
        assert_eq!(
            select_location(&deployment("SEA"), &locations),
            LocationSelection::NoCandidates
        );
        assert_eq!(select_location(&deployment("DFW"), &[]), LocationSelection::NoLocations);
    }

    #[tokio::test]
    async fn test_assigns_location_and_cluster() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_locations()
            .returning(|| Ok(vec![location("dfw-1", "DFW")]));
        store
            .expect_patch_deployment_status()
            .withf(|_, status| {
                status.location
                    == Some(LocationReference {
                        name: "dfw-1".to_string(),
                        namespace: "datum-system".to_string(),
                    })
                    && status.cluster_ref.as_ref().is_some_and(|c| c.name == "dfw-1-cluster")
                    && status
                        .conditions
                        .get(CONDITION_AVAILABLE)
                        .is_some_and(|c| {
                            c.status == CONDITION_FALSE && c.reason == REASON_LOCATION_ASSIGNED
                        })
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let scheduler = DeploymentScheduler::new(Arc::new(store), Duration::from_secs(5));
        let action = scheduler.reconcile(Arc::new(deployment("DFW"))).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_no_locations_requeues() {
        let mut store = MockObjectStore::new();
        store.expect_list_locations().returning(|| Ok(vec![]));
        store
            .expect_patch_deployment_status()
            .withf(|_, status| {
                status.location.is_none()
                    && status
                        .conditions
                        .get(CONDITION_AVAILABLE)
                        .is_some_and(|c| c.reason == REASON_NO_LOCATIONS)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let scheduler = DeploymentScheduler::new(Arc::new(store), Duration::from_secs(5));
        let action = scheduler.reconcile(Arc::new(deployment("DFW"))).await.unwrap();
        assert_eq!(action, Action::requeue(NO_LOCATIONS_REQUEUE));
    }

    #[tokio::test]
    async fn test_no_candidates_waits_without_rewriting() {
        let mut existing = deployment("SEA");
        let mut status = existing.status.clone().unwrap_or_default();
        status.conditions.set(available_false(
            &existing,
            REASON_NO_CANDIDATE_LOCATIONS,
            "No locations are candidates for this deployment.",
        ));
        existing.status = Some(status);

        let mut store = MockObjectStore::new();
        store
            .expect_list_locations()
            .returning(|| Ok(vec![location("dfw-1", "DFW")]));

        let scheduler = DeploymentScheduler::new(Arc::new(store), Duration::from_secs(5));
        let action = scheduler.reconcile(Arc::new(existing)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_scheduled_deployment_is_left_alone() {
        let mut scheduled = deployment("DFW");
        scheduled.status = Some(crate::crd::WorkloadDeploymentStatus {
            location: Some(LocationReference {
                name: "dfw-1".to_string(),
                namespace: "datum-system".to_string(),
            }),
            ..Default::default()
        });

        let scheduler =
            DeploymentScheduler::new(Arc::new(MockObjectStore::new()), Duration::from_secs(5));
        let action = scheduler.reconcile(Arc::new(scheduled)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
