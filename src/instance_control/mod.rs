//! Instance control
//!
//! A [`Strategy`] looks at a deployment and its current instances and returns
//! the [`Action`]s needed to converge them. Strategies are pure; actions are
//! executed afterwards by the deployment controller against an
//! [`ObjectStore`].

mod hash;
mod stateful;

pub use hash::compute_hash;
pub use stateful::{instance_ordinal, OrderedReadyControl};

use crate::crd::{Instance, InstanceManagementPolicy, WorkloadDeployment};
use crate::error::Result;
use crate::store::ObjectStore;
use kube::ResourceExt;
use std::fmt;

/// Gate held on new instances until the deployment's networks are ready
pub const NETWORK_SCHEDULING_GATE: &str = "Network";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Create,
    Update,
    Delete,
    Wait,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Create => "Create",
            ActionType::Update => "Update",
            ActionType::Delete => "Delete",
            ActionType::Wait => "Wait",
        };
        f.write_str(s)
    }
}

/// A deferred write against one instance
#[derive(Debug, Clone)]
pub struct Action {
    instance: Instance,
    action_type: ActionType,
    skipped: bool,
}

impl Action {
    pub fn create(instance: Instance) -> Self {
        Self::new(instance, ActionType::Create)
    }

    pub fn update(instance: Instance) -> Self {
        Self::new(instance, ActionType::Update)
    }

    pub fn delete(instance: Instance) -> Self {
        Self::new(instance, ActionType::Delete)
    }

    /// Informational; executing it does nothing
    pub fn wait(instance: Instance) -> Self {
        Self::new(instance, ActionType::Wait)
    }

    fn new(instance: Instance, action_type: ActionType) -> Self {
        Self {
            instance,
            action_type,
            skipped: false,
        }
    }

    pub fn skip(&mut self) {
        self.skipped = true;
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn instance_name(&self) -> String {
        self.instance.name_any()
    }

    pub(crate) fn ordinal(&self) -> i32 {
        instance_ordinal(&self.instance.name_any())
    }

    /// Perform the write. Skipped actions succeed without touching the store.
    pub async fn execute(&self, store: &dyn ObjectStore) -> Result<()> {
        if self.skipped {
            return Ok(());
        }
        match self.action_type {
            ActionType::Create => store.create_instance(&self.instance).await,
            ActionType::Update => store.replace_instance(&self.instance).await,
            ActionType::Delete => store.delete_instance(&self.instance).await,
            ActionType::Wait => Ok(()),
        }
    }
}

/// Decides which actions drive a deployment's instances to the desired state
pub trait Strategy: Send + Sync {
    fn get_actions(
        &self,
        deployment: &WorkloadDeployment,
        current: &[Instance],
    ) -> Result<Vec<Action>>;
}

/// Strategy implementing the deployment's instance management policy
pub fn strategy_for(policy: InstanceManagementPolicy) -> Box<dyn Strategy> {
    match policy {
        InstanceManagementPolicy::OrderedReady => Box::new(OrderedReadyControl),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::InstanceSpec;
    use crate::store::MockObjectStore;

    fn instance(name: &str) -> Instance {
        let mut instance = Instance::new(name, InstanceSpec::default());
        instance.metadata.namespace = Some("default".to_string());
        instance
    }

    #[tokio::test]
    async fn test_create_action_creates_instance() {
        let mut store = MockObjectStore::new();
        store
            .expect_create_instance()
            .withf(|i| i.name_any() == "web-0")
            .times(1)
            .returning(|_| Ok(()));

        Action::create(instance("web-0")).execute(&store).await.unwrap();
    }

    #[tokio::test]
    async fn test_skipped_action_does_nothing() {
        let store = MockObjectStore::new();
        let mut action = Action::delete(instance("web-1"));
        action.skip();

        assert!(action.is_skipped());
        action.execute(&store).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_action_does_nothing() {
        let store = MockObjectStore::new();
        Action::wait(instance("web-0")).execute(&store).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_and_delete_dispatch() {
        let mut store = MockObjectStore::new();
        store.expect_replace_instance().times(1).returning(|_| Ok(()));
        store.expect_delete_instance().times(1).returning(|_| Ok(()));

        Action::update(instance("web-0")).execute(&store).await.unwrap();
        Action::delete(instance("web-1")).execute(&store).await.unwrap();
    }

    #[test]
    fn test_action_type_display() {
        assert_eq!(ActionType::Create.to_string(), "Create");
        assert_eq!(ActionType::Wait.to_string(), "Wait");
    }
}
