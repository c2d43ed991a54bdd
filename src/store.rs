//! Typed access to the objects the controllers read and write
//!
//! Reconcilers talk to the API server only through [`ObjectStore`], one method
//! per kind and verb they need. Reads of missing objects return `None`; every
//! write carries the object's `resourceVersion` so concurrent writers surface
//! as [`OperatorError::Conflict`](crate::error::OperatorError::Conflict).

use crate::crd::{
    Instance, InstanceStatus, Location, Network, NetworkBinding, NetworkContext, SchedulingGate,
    Subnet, SubnetClaim, Workload, WorkloadDeployment, WorkloadDeploymentStatus, WorkloadStatus,
    WORKLOAD_DEPLOYMENT_UID_LABEL, WORKLOAD_UID_LABEL,
};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_network(&self, namespace: &str, name: &str) -> Result<Option<Network>>;

    /// All Locations, in listing order
    async fn list_locations(&self) -> Result<Vec<Location>>;

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadDeployment>>;

    /// Deployments labelled with the workload UID
    async fn list_deployments_for_workload(
        &self,
        namespace: &str,
        workload_uid: &str,
    ) -> Result<Vec<WorkloadDeployment>>;

    async fn create_deployment(
        &self,
        deployment: &WorkloadDeployment,
    ) -> Result<WorkloadDeployment>;

    async fn replace_deployment(
        &self,
        deployment: &WorkloadDeployment,
    ) -> Result<WorkloadDeployment>;

    async fn delete_deployment(&self, deployment: &WorkloadDeployment) -> Result<()>;

    async fn patch_deployment_status(
        &self,
        deployment: &WorkloadDeployment,
        status: &WorkloadDeploymentStatus,
    ) -> Result<()>;

    async fn set_deployment_finalizers(
        &self,
        deployment: &WorkloadDeployment,
        finalizers: Vec<String>,
    ) -> Result<()>;

    async fn patch_workload_status(
        &self,
        workload: &Workload,
        status: &WorkloadStatus,
    ) -> Result<()>;

    async fn set_workload_finalizers(
        &self,
        workload: &Workload,
        finalizers: Vec<String>,
    ) -> Result<()>;

    /// Instances labelled with the deployment UID
    async fn list_instances_for_deployment(
        &self,
        namespace: &str,
        deployment_uid: &str,
    ) -> Result<Vec<Instance>>;

    async fn create_instance(&self, instance: &Instance) -> Result<()>;

    async fn replace_instance(&self, instance: &Instance) -> Result<()>;

    async fn delete_instance(&self, instance: &Instance) -> Result<()>;

    async fn patch_instance_status(
        &self,
        instance: &Instance,
        status: &InstanceStatus,
    ) -> Result<()>;

    async fn set_instance_scheduling_gates(
        &self,
        instance: &Instance,
        gates: Vec<SchedulingGate>,
    ) -> Result<()>;

    async fn get_network_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkBinding>>;

    async fn create_network_binding(&self, binding: &NetworkBinding) -> Result<NetworkBinding>;

    async fn get_network_context(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkContext>>;

    async fn list_subnet_claims(&self, namespace: &str) -> Result<Vec<SubnetClaim>>;

    async fn create_subnet_claim(&self, claim: &SubnetClaim) -> Result<SubnetClaim>;

    async fn get_subnet(&self, namespace: &str, name: &str) -> Result<Option<Subnet>>;
}

/// [`ObjectStore`] backed by one cluster's API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn display_name<K: Resource>(obj: &K) -> &str {
    obj.meta().name.as_deref().unwrap_or("<unnamed>")
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| {
            OperatorError::InvalidState(format!("{} has no namespace", display_name(obj)))
        })
}

fn resource_version_of<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .resource_version
        .clone()
        .ok_or_else(|| {
            OperatorError::InvalidState(format!("{} has no resourceVersion", display_name(obj)))
        })
}

/// Merge patch guarded by the object's resourceVersion
fn guarded_patch<K: Resource>(obj: &K, body: serde_json::Value) -> Result<serde_json::Value> {
    let mut patch = json!({ "metadata": { "resourceVersion": resource_version_of(obj)? } });
    if let (Some(target), Some(fields)) = (patch.as_object_mut(), body.as_object()) {
        for (k, v) in fields {
            if k == "metadata" {
                let meta = target.get_mut("metadata").and_then(|m| m.as_object_mut());
                if let (Some(meta), Some(extra)) = (meta, v.as_object()) {
                    meta.extend(extra.clone());
                }
            } else {
                target.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(patch)
}

fn ignore_not_found(result: std::result::Result<(), OperatorError>) -> Result<()> {
    match result {
        Err(OperatorError::NotFound(_)) => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_network(&self, namespace: &str, name: &str) -> Result<Option<Network>> {
        Ok(self.api::<Network>(namespace).get_opt(name).await?)
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        let locations: Api<Location> = Api::all(self.client.clone());
        Ok(locations.list(&ListParams::default()).await?.items)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadDeployment>> {
        Ok(self.api::<WorkloadDeployment>(namespace).get_opt(name).await?)
    }

    async fn list_deployments_for_workload(
        &self,
        namespace: &str,
        workload_uid: &str,
    ) -> Result<Vec<WorkloadDeployment>> {
        let lp = ListParams::default().labels(&format!("{}={}", WORKLOAD_UID_LABEL, workload_uid));
        Ok(self.api::<WorkloadDeployment>(namespace).list(&lp).await?.items)
    }

    async fn create_deployment(
        &self,
        deployment: &WorkloadDeployment,
    ) -> Result<WorkloadDeployment> {
        let ns = namespace_of(deployment)?;
        Ok(self
            .api::<WorkloadDeployment>(&ns)
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn replace_deployment(
        &self,
        deployment: &WorkloadDeployment,
    ) -> Result<WorkloadDeployment> {
        let ns = namespace_of(deployment)?;
        Ok(self
            .api::<WorkloadDeployment>(&ns)
            .replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?)
    }

    async fn delete_deployment(&self, deployment: &WorkloadDeployment) -> Result<()> {
        let ns = namespace_of(deployment)?;
        let result = self
            .api::<WorkloadDeployment>(&ns)
            .delete(&deployment.name_any(), &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(OperatorError::from);
        ignore_not_found(result)
    }

    async fn patch_deployment_status(
        &self,
        deployment: &WorkloadDeployment,
        status: &WorkloadDeploymentStatus,
    ) -> Result<()> {
        let ns = namespace_of(deployment)?;
        let patch = guarded_patch(deployment, json!({ "status": status }))?;
        self.api::<WorkloadDeployment>(&ns)
            .patch_status(&deployment.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_deployment_finalizers(
        &self,
        deployment: &WorkloadDeployment,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let ns = namespace_of(deployment)?;
        let patch = guarded_patch(deployment, json!({ "metadata": { "finalizers": finalizers } }))?;
        self.api::<WorkloadDeployment>(&ns)
            .patch(&deployment.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_workload_status(
        &self,
        workload: &Workload,
        status: &WorkloadStatus,
    ) -> Result<()> {
        let ns = namespace_of(workload)?;
        let patch = guarded_patch(workload, json!({ "status": status }))?;
        self.api::<Workload>(&ns)
            .patch_status(&workload.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_workload_finalizers(
        &self,
        workload: &Workload,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let ns = namespace_of(workload)?;
        let patch = guarded_patch(workload, json!({ "metadata": { "finalizers": finalizers } }))?;
        self.api::<Workload>(&ns)
            .patch(&workload.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_instances_for_deployment(
        &self,
        namespace: &str,
        deployment_uid: &str,
    ) -> Result<Vec<Instance>> {
        let lp = ListParams::default()
            .labels(&format!("{}={}", WORKLOAD_DEPLOYMENT_UID_LABEL, deployment_uid));
        Ok(self.api::<Instance>(namespace).list(&lp).await?.items)
    }

    async fn create_instance(&self, instance: &Instance) -> Result<()> {
        let ns = namespace_of(instance)?;
        self.api::<Instance>(&ns)
            .create(&PostParams::default(), instance)
            .await?;
        Ok(())
    }

    async fn replace_instance(&self, instance: &Instance) -> Result<()> {
        let ns = namespace_of(instance)?;
        self.api::<Instance>(&ns)
            .replace(&instance.name_any(), &PostParams::default(), instance)
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        let ns = namespace_of(instance)?;
        let result = self
            .api::<Instance>(&ns)
            .delete(&instance.name_any(), &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(OperatorError::from);
        ignore_not_found(result)
    }

    async fn patch_instance_status(
        &self,
        instance: &Instance,
        status: &InstanceStatus,
    ) -> Result<()> {
        let ns = namespace_of(instance)?;
        let patch = guarded_patch(instance, json!({ "status": status }))?;
        self.api::<Instance>(&ns)
            .patch_status(&instance.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_instance_scheduling_gates(
        &self,
        instance: &Instance,
        gates: Vec<SchedulingGate>,
    ) -> Result<()> {
        let ns = namespace_of(instance)?;
        let patch = guarded_patch(
            instance,
            json!({ "spec": { "controller": { "schedulingGates": gates } } }),
        )?;
        self.api::<Instance>(&ns)
            .patch(&instance.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_network_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkBinding>> {
        Ok(self.api::<NetworkBinding>(namespace).get_opt(name).await?)
    }

    async fn create_network_binding(&self, binding: &NetworkBinding) -> Result<NetworkBinding> {
        let ns = namespace_of(binding)?;
        Ok(self
            .api::<NetworkBinding>(&ns)
            .create(&PostParams::default(), binding)
            .await?)
    }

    async fn get_network_context(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkContext>> {
        Ok(self.api::<NetworkContext>(namespace).get_opt(name).await?)
    }

    async fn list_subnet_claims(&self, namespace: &str) -> Result<Vec<SubnetClaim>> {
        Ok(self
            .api::<SubnetClaim>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn create_subnet_claim(&self, claim: &SubnetClaim) -> Result<SubnetClaim> {
        let ns = namespace_of(claim)?;
        Ok(self
            .api::<SubnetClaim>(&ns)
            .create(&PostParams::default(), claim)
            .await?)
    }

    async fn get_subnet(&self, namespace: &str, name: &str) -> Result<Option<Subnet>> {
        Ok(self.api::<Subnet>(namespace).get_opt(name).await?)
    }
}
