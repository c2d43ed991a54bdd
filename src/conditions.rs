//! Kubernetes-standard status condition helpers
//!
//! Conditions are held in a [`ConditionSet`], keyed by condition type, and
//! serialized as the usual `conditions: []` list. Upserting a condition only
//! moves `lastTransitionTime` when its status actually changes.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// Condition types shared by Workload, WorkloadDeployment and placements
pub const CONDITION_AVAILABLE: &str = "Available";

// Instance condition types
pub const INSTANCE_CONDITION_READY: &str = "Ready";
pub const INSTANCE_CONDITION_PROGRAMMED: &str = "Programmed";
pub const INSTANCE_CONDITION_RUNNING: &str = "Running";

// Networking condition type, reported by every kind in the dependency chain
pub const NETWORK_CONDITION_READY: &str = "Ready";

// Finalizer names
pub const WORKLOAD_FINALIZER: &str = "compute.datumapis.com/workload-controller";
pub const DEPLOYMENT_FINALIZER: &str = "compute.datumapis.com/deployment-controller";

/// Build a condition stamped with the current time.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> Condition {
    Condition {
        type_: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Time(Utc::now()),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: None,
    }
}

/// Status conditions keyed by type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct ConditionSet(BTreeMap<String, Condition>);

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, condition_type: &str) -> Option<&Condition> {
        self.0.get(condition_type)
    }

    /// True only when the condition exists and its status is `True`.
    pub fn is_true(&self, condition_type: &str) -> bool {
        self.get(condition_type)
            .is_some_and(|c| c.status == CONDITION_TRUE)
    }

    /// Upsert a condition and report whether anything observable changed.
    ///
    /// `lastTransitionTime` is replaced only when the status flips; reason,
    /// message and observed generation are always refreshed.
    pub fn set(&mut self, new: Condition) -> bool {
        match self.0.get_mut(&new.type_) {
            Some(existing) if existing.status != new.status => {
                *existing = new;
                true
            }
            Some(existing) => {
                let changed = existing.reason != new.reason
                    || existing.message != new.message
                    || existing.observed_generation != new.observed_generation;
                existing.reason = new.reason;
                existing.message = new.message;
                existing.observed_generation = new.observed_generation;
                changed
            }
            None => {
                self.0.insert(new.type_.clone(), new);
                true
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Condition>> for ConditionSet {
    fn from(conditions: Vec<Condition>) -> Self {
        Self(
            conditions
                .into_iter()
                .map(|c| (c.type_.clone(), c))
                .collect(),
        )
    }
}

impl From<ConditionSet> for Vec<Condition> {
    fn from(set: ConditionSet) -> Self {
        set.0.into_values().collect()
    }
}

impl JsonSchema for ConditionSet {
    fn schema_name() -> String {
        "ConditionSet".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        <Vec<Condition>>::json_schema(gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dated(condition_type: &str, status: &str, reason: &str) -> Condition {
        Condition {
            last_transition_time: Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            ..build_condition(condition_type, status, reason, "msg")
        }
    }

    #[test]
    fn test_build_condition() {
        let cond = build_condition(
            CONDITION_AVAILABLE,
            CONDITION_TRUE,
            "StableInstanceFound",
            "1/1 ready",
        );
        assert_eq!(cond.type_, "Available");
        assert_eq!(cond.status, "True");
        assert_eq!(cond.reason, "StableInstanceFound");
        assert_eq!(cond.message, "1/1 ready");
        assert!(cond.observed_generation.is_none());
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = ConditionSet::new();
        assert!(conditions.set(build_condition("Ready", CONDITION_TRUE, "OK", "ok")));
        assert_eq!(conditions.len(), 1);
        assert!(conditions.is_true("Ready"));
    }

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = ConditionSet::new();
        conditions.set(dated("Ready", CONDITION_TRUE, "First"));

        let changed = conditions.set(build_condition("Ready", CONDITION_TRUE, "Second", "second"));

        assert!(changed);
        let ready = conditions.get("Ready").unwrap();
        assert_eq!(ready.last_transition_time.0.timestamp(), 1704067200);
        assert_eq!(ready.reason, "Second");
    }

    #[test]
    fn test_set_condition_updates_transition_time_on_status_change() {
        let mut conditions = ConditionSet::new();
        conditions.set(dated("Ready", CONDITION_FALSE, "NotReady"));

        assert!(conditions.set(build_condition("Ready", CONDITION_TRUE, "AllReady", "all ready")));
        assert_ne!(
            conditions.get("Ready").unwrap().last_transition_time.0.timestamp(),
            1704067200
        );
    }

    #[test]
    fn test_set_identical_condition_reports_no_change() {
        let mut conditions = ConditionSet::new();
        conditions.set(dated("Ready", CONDITION_FALSE, "Pending"));
        assert!(!conditions.set(build_condition("Ready", CONDITION_FALSE, "Pending", "msg")));
    }

    #[test]
    fn test_serializes_as_list() {
        let mut conditions = ConditionSet::new();
        conditions.set(build_condition("Ready", CONDITION_TRUE, "OK", "ok"));
        conditions.set(build_condition("Programmed", CONDITION_TRUE, "OK", "ok"));

        let value = serde_json::to_value(&conditions).unwrap();
        let list = value.as_array().unwrap();
        assert_eq!(list.len(), 2);

        let back: ConditionSet = serde_json::from_value(value).unwrap();
        assert!(back.is_true("Programmed"));
    }
}
