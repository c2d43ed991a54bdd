//! Ordered, ready-gated instance control
//!
//! Each deployment keeps exactly one instance per ordinal slot
//! `0..minReplicas`. Instances are created, updated and removed one at a time:
//! creation proceeds upward and waits for each instance to become ready,
//! updates and removals proceed downward from the highest ordinal.

use super::{compute_hash, Action, Strategy, NETWORK_SCHEDULING_GATE};
use crate::crd::{
    Instance, InstanceController, SchedulingGate, WorkloadDeployment, INSTANCE_INDEX_LABEL,
    WORKLOAD_DEPLOYMENT_UID_LABEL, WORKLOAD_UID_LABEL,
};
use crate::error::{OperatorError, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Ordinal encoded as the trailing `-<n>` of an instance name, or `-1`.
pub fn instance_ordinal(name: &str) -> i32 {
    name.rsplit_once('-')
        .map(|(_, suffix)| suffix)
        .filter(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|suffix| suffix.parse::<i32>().ok())
        .unwrap_or(-1)
}

/// Strategy for the `OrderedReady` instance management policy
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderedReadyControl;

impl Strategy for OrderedReadyControl {
    fn get_actions(
        &self,
        deployment: &WorkloadDeployment,
        current: &[Instance],
    ) -> Result<Vec<Action>> {
        let template_hash = compute_hash(&deployment.spec.template)?;
        let slot_count = usize::try_from(deployment.spec.scale_settings.min_replicas).unwrap_or(0);

        // lowest -> highest
        let mut creates_and_waits = Vec::new();
        // highest -> lowest
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        let mut slots: Vec<Option<&Instance>> = vec![None; slot_count];
        for instance in current {
            let ordinal = match usize::try_from(instance_ordinal(&instance.name_any())) {
                Ok(i) if i < slot_count => i,
                _ => {
                    deletes.push(Action::delete(instance.clone()));
                    continue;
                }
            };
            let slot = &mut slots[ordinal];
            // Two names can parse to one ordinal (`web-1`, `web-01`). The
            // slot keeps the canonically named instance; the other goes.
            match slot.replace(instance) {
                None => {}
                Some(held) if held.name_any() == slot_name(deployment, ordinal) => {
                    *slot = Some(held);
                    deletes.push(Action::delete(instance.clone()));
                }
                Some(held) => deletes.push(Action::delete(held.clone())),
            }
        }

        for (ordinal, slot) in slots.into_iter().enumerate() {
            let Some(instance) = slot else {
                creates_and_waits.push(Action::create(new_instance(
                    deployment,
                    ordinal,
                    &template_hash,
                    owner_reference(deployment)?,
                )));
                continue;
            };

            if instance.metadata.deletion_timestamp.is_some() || !instance.is_ready() {
                creates_and_waits.push(Action::wait(instance.clone()));
            } else if needs_update(instance, &template_hash) {
                updates.push(Action::update(updated_instance(
                    deployment,
                    instance,
                    ordinal,
                    &template_hash,
                )));
            }
        }

        creates_and_waits.sort_by_key(Action::ordinal);
        updates.sort_by_key(|a| Reverse(a.ordinal()));
        deletes.sort_by_key(|a| Reverse(a.ordinal()));

        let mut actions = creates_and_waits;
        actions.extend(updates);
        actions.extend(deletes);

        for action in actions.iter_mut().skip(1) {
            action.skip();
        }

        Ok(actions)
    }
}

fn slot_name(deployment: &WorkloadDeployment, ordinal: usize) -> String {
    format!("{}-{}", deployment.name_any(), ordinal)
}

fn owner_reference(deployment: &WorkloadDeployment) -> Result<OwnerReference> {
    deployment.controller_owner_ref(&()).ok_or_else(|| {
        OperatorError::InvalidState(format!(
            "cannot build owner reference for deployment {}",
            deployment.name_any()
        ))
    })
}

fn needs_update(instance: &Instance, template_hash: &str) -> bool {
    instance
        .spec
        .controller
        .as_ref()
        .map_or(true, |c| c.template_hash != template_hash)
}

fn controller_labels(
    deployment: &WorkloadDeployment,
    ordinal: usize,
    mut labels: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    labels.insert(INSTANCE_INDEX_LABEL.to_string(), ordinal.to_string());
    labels.insert(
        WORKLOAD_UID_LABEL.to_string(),
        deployment.spec.workload_ref.uid.clone(),
    );
    labels.insert(
        WORKLOAD_DEPLOYMENT_UID_LABEL.to_string(),
        deployment.uid().unwrap_or_default(),
    );
    labels
}

fn annotations_of(deployment: &WorkloadDeployment) -> Option<BTreeMap<String, String>> {
    let annotations = &deployment.spec.template.metadata.annotations;
    (!annotations.is_empty()).then(|| annotations.clone())
}

pub(crate) fn new_instance(
    deployment: &WorkloadDeployment,
    ordinal: usize,
    template_hash: &str,
    owner: OwnerReference,
) -> Instance {
    let template = &deployment.spec.template;
    let mut instance = Instance::new(&slot_name(deployment, ordinal), template.spec.clone());
    instance.metadata.namespace = deployment.namespace();
    instance.metadata.labels = Some(controller_labels(
        deployment,
        ordinal,
        template.metadata.labels.clone(),
    ));
    instance.metadata.annotations = annotations_of(deployment);
    instance.metadata.owner_references = Some(vec![owner]);

    instance.spec.location = deployment.location().cloned();
    instance.spec.controller = Some(InstanceController {
        template_hash: template_hash.to_string(),
        scheduling_gates: vec![SchedulingGate {
            name: NETWORK_SCHEDULING_GATE.to_string(),
        }],
    });
    instance
}

fn updated_instance(
    deployment: &WorkloadDeployment,
    current: &Instance,
    ordinal: usize,
    template_hash: &str,
) -> Instance {
    let template = &deployment.spec.template;
    let mut instance = current.clone();
    instance.metadata.labels = Some(controller_labels(
        deployment,
        ordinal,
        template.metadata.labels.clone(),
    ));
    instance.metadata.annotations = annotations_of(deployment);

    instance.spec = template.spec.clone();
    instance.spec.location = current.spec.location.clone();
    instance.spec.controller = Some(InstanceController {
        template_hash: template_hash.to_string(),
        scheduling_gates: current.scheduling_gates().to_vec(),
    });
    instance
}
