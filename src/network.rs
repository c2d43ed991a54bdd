//! Network dependency staging for WorkloadDeployments
//!
//! Instances of a deployment stay behind the `Network` scheduling gate until
//! every link of the chain NetworkBinding -> NetworkContext -> SubnetClaim ->
//! Subnet reports `Ready`. Missing links are created where this operator owns
//! them and otherwise simply reported as not ready.

use crate::conditions::{ConditionSet, NETWORK_CONDITION_READY};
use crate::crd::{
    IpFamily, LocalNetworkContextRef, LocationReference, NetworkBinding, NetworkBindingSpec,
    NetworkContext, NetworkContextRef, SubnetClaim, SubnetClaimSpec, WorkloadDeployment,
    SUBNET_CLASS_PRIVATE,
};
use crate::error::{OperatorError, Result};
use crate::store::ObjectStore;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

/// Name of the binding maintained for interface `index` of a deployment
pub fn network_binding_name(deployment_name: &str, index: usize) -> String {
    format!("{}-net-{}", deployment_name, index)
}

fn is_ready(conditions: Option<&ConditionSet>) -> bool {
    conditions.is_some_and(|c| c.is_true(NETWORK_CONDITION_READY))
}

/// Drive the deployment's network dependencies forward.
///
/// Returns `Ok(true)` only when every binding, context, claim and subnet is
/// ready. Not-ready links yield `Ok(false)`; errors are reserved for failed
/// reads and writes.
pub async fn reconcile_networks(
    store: &dyn ObjectStore,
    deployment: &WorkloadDeployment,
) -> Result<bool> {
    let Some(location) = deployment.location() else {
        return Ok(false);
    };
    let namespace = deployment
        .namespace()
        .ok_or_else(|| {
            OperatorError::InvalidState(format!(
                "deployment {} has no namespace",
                deployment.name_any()
            ))
        })?;
    let deployment_name = deployment.name_any();

    let mut context_refs = Vec::new();
    let mut all_bindings_ready = true;
    for (index, interface) in deployment.spec.template.spec.network_interfaces.iter().enumerate() {
        let name = network_binding_name(&deployment_name, index);
        let binding = match store.get_network_binding(&namespace, &name).await? {
            Some(binding) => binding,
            None => {
                let owner = deployment.controller_owner_ref(&()).ok_or_else(|| {
                    OperatorError::InvalidState(format!(
                        "cannot build owner reference for deployment {}",
                        deployment_name
                    ))
                })?;
                let mut binding = NetworkBinding::new(
                    &name,
                    NetworkBindingSpec {
                        network: interface.network.clone(),
                        location: location.clone(),
                    },
                );
                binding.metadata.namespace = Some(namespace.clone());
                binding.metadata.owner_references = Some(vec![owner]);

                info!(deployment = %deployment_name, binding = %name, "Creating network binding");
                store.create_network_binding(&binding).await?
            }
        };

        let status = binding.status.as_ref();
        if !is_ready(status.map(|s| &s.conditions)) {
            all_bindings_ready = false;
        } else if let Some(context_ref) = status.and_then(|s| s.network_context_ref.clone()) {
            context_refs.push(context_ref);
        }
    }

    if !all_bindings_ready {
        debug!(deployment = %deployment_name, "Waiting for network bindings to be ready");
        return Ok(false);
    }

    for context_ref in &context_refs {
        if !reconcile_subnet(store, context_ref, location, &deployment_name).await? {
            return Ok(false);
        }
    }

    Ok(true)
}

async fn reconcile_subnet(
    store: &dyn ObjectStore,
    context_ref: &NetworkContextRef,
    location: &LocationReference,
    deployment_name: &str,
) -> Result<bool> {
    let Some(context) = store
        .get_network_context(&context_ref.namespace, &context_ref.name)
        .await?
    else {
        debug!(network_context = %context_ref.name, "Network context not found yet");
        return Ok(false);
    };

    if !is_ready(context.status.as_ref().map(|s| &s.conditions)) {
        debug!(network_context = %context_ref.name, "Waiting for network context to be ready");
        return Ok(false);
    }

    let claims = store.list_subnet_claims(&context_ref.namespace).await?;
    let claim = claims.into_iter().find(|claim| {
        claim.spec.subnet_class == SUBNET_CLASS_PRIVATE
            && claim.spec.ip_family == IpFamily::Ipv4
            && claim.spec.network_context.name == context_ref.name
            && claim.spec.location == *location
    });

    let Some(claim) = claim else {
        let claim = new_subnet_claim(&context, location)?;
        info!(
            deployment = %deployment_name,
            subnet_claim = %claim.name_any(),
            "Creating subnet claim"
        );
        store.create_subnet_claim(&claim).await?;
        return Ok(false);
    };

    let claim_status = claim.status.as_ref();
    if !is_ready(claim_status.map(|s| &s.conditions)) {
        debug!(subnet_claim = %claim.name_any(), "Waiting for subnet claim to be ready");
        return Ok(false);
    }

    let Some(subnet_ref) = claim_status.and_then(|s| s.subnet_ref.as_ref()) else {
        return Ok(false);
    };

    match store.get_subnet(&context_ref.namespace, &subnet_ref.name).await? {
        Some(subnet) if is_ready(subnet.status.as_ref().map(|s| &s.conditions)) => {
            debug!(subnet = %subnet_ref.name, "Subnet is ready");
            Ok(true)
        }
        _ => {
            debug!(subnet = %subnet_ref.name, "Waiting for subnet to be ready");
            Ok(false)
        }
    }
}

/// The IPv4 private claim for a context, always named `<context>-0`
fn new_subnet_claim(context: &NetworkContext, location: &LocationReference) -> Result<SubnetClaim> {
    let context_name = context.name_any();
    let owner = context.owner_ref(&()).ok_or_else(|| {
        OperatorError::InvalidState(format!(
            "cannot build owner reference for network context {}",
            context_name
        ))
    })?;

    let mut claim = SubnetClaim::new(
        &format!("{}-0", context_name),
        SubnetClaimSpec {
            subnet_class: SUBNET_CLASS_PRIVATE.to_string(),
            ip_family: IpFamily::Ipv4,
            network_context: LocalNetworkContextRef {
                name: context_name.clone(),
            },
            location: location.clone(),
            prefix_length: None,
            start_address: None,
        },
    );
    claim.metadata.namespace = context.namespace();
    claim.metadata.owner_references = Some(vec![owner]);
    Ok(claim)
}
