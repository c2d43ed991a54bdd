//! Registry of engaged clusters
//!
//! The operator runs against its own ("local") cluster and any number of
//! execution clusters. Engaging a cluster records its client and the
//! controller tasks started for it; disengaging aborts those tasks.
//!
//! Workloads are expanded and scheduled on the local cluster. Deployments and
//! their Instances are reconciled on execution clusters, or on the local
//! cluster when no execution cluster is configured.

use crate::error::{OperatorError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

/// Name the operator's own cluster is engaged under
pub const LOCAL_CLUSTER: &str = "local";

/// Controllers to run against one engaged cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSet {
    pub workloads: bool,
    pub scheduler: bool,
    pub deployments: bool,
    pub instances: bool,
}

impl ControllerSet {
    pub fn for_cluster(name: &str, execution_clusters: usize) -> Self {
        let local = name == LOCAL_CLUSTER;
        let executes = !local || execution_clusters == 0;
        Self {
            workloads: local,
            scheduler: local,
            deployments: executes,
            instances: executes,
        }
    }
}

struct Engaged<C> {
    client: C,
    tasks: Vec<JoinHandle<()>>,
}

/// Engaged clusters keyed by name
pub struct ClusterRegistry<C = kube::Client> {
    clusters: RwLock<HashMap<String, Engaged<C>>>,
}

impl<C: Clone> Default for ClusterRegistry<C> {
    fn default() -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: Clone> ClusterRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engage a cluster, handing its client to `start` which spawns the
    /// cluster's controllers.
    pub async fn engage<F>(&self, name: &str, client: C, start: F) -> Result<()>
    where
        F: FnOnce(C) -> Vec<JoinHandle<()>>,
    {
        let mut clusters = self.clusters.write().await;
        if clusters.contains_key(name) {
            return Err(OperatorError::Configuration(format!(
                "cluster {} is already engaged",
                name
            )));
        }
        let tasks = start(client.clone());
        info!(cluster = %name, controllers = tasks.len(), "Engaged cluster");
        clusters.insert(name.to_string(), Engaged { client, tasks });
        Ok(())
    }

    /// Stop a cluster's controllers and forget it. Returns false when the
    /// cluster was not engaged.
    pub async fn disengage(&self, name: &str) -> bool {
        let Some(engaged) = self.clusters.write().await.remove(name) else {
            return false;
        };
        for task in &engaged.tasks {
            task.abort();
        }
        info!(cluster = %name, "Disengaged cluster");
        true
    }

    pub async fn disengage_all(&self) {
        for name in self.names().await {
            self.disengage(&name).await;
        }
    }

    pub async fn client_for(&self, name: &str) -> Option<C> {
        self.clusters.read().await.get(name).map(|e| e.client.clone())
    }

    /// Engaged cluster names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
