//! Workload Kubernetes Operator
//!
//! Reconciles Workloads into WorkloadDeployments and Instances across the
//! local cluster and any additional execution clusters.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator against the current kubeconfig context
//! workload-operator
//!
//! # Also engage two execution clusters from the kubeconfig
//! workload-operator --cluster-context edge-dfw --cluster-context edge-lax
//!
//! # Run with custom log level
//! RUST_LOG=debug workload-operator
//! ```

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use workload_operator::clusters::{ClusterRegistry, ControllerSet, LOCAL_CLUSTER};
use workload_operator::controllers::{
    DeploymentReconciler, DeploymentScheduler, InstanceReconciler, WatchScope, WorkloadReconciler,
    DEFAULT_ERROR_BACKOFF,
};
use workload_operator::leader_election::{self, LeaderElector, DEFAULT_LEASE_NAME};
use workload_operator::store::{KubeStore, ObjectStore};

/// Workload Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "workload-operator")]
#[command(version, about = "Kubernetes Operator placing Workloads onto Locations")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, env = "LEADER_ELECTION", default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "")]
    leader_election_namespace: String,

    /// Name of the leader election Lease
    #[arg(long, env = "LEADER_ELECTION_LEASE_NAME", default_value = DEFAULT_LEASE_NAME)]
    leader_election_lease_name: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Kubeconfig context of an additional execution cluster to engage
    #[arg(long = "cluster-context", env = "CLUSTER_CONTEXTS", value_delimiter = ',')]
    cluster_contexts: Vec<String>,

    /// Seconds to wait before retrying a failed reconcile
    #[arg(long, env = "ERROR_BACKOFF_SECONDS", default_value_t = DEFAULT_ERROR_BACKOFF.as_secs())]
    error_backoff_seconds: u64,
}

/// Spawn the controllers `set` selects for one cluster
fn start_controllers(
    scope: WatchScope,
    error_backoff: Duration,
    set: ControllerSet,
) -> Vec<JoinHandle<()>> {
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(scope.client.clone()));
    let mut handles = Vec::new();

    if set.workloads {
        let workloads = Arc::new(WorkloadReconciler::new(Arc::clone(&store), error_backoff));
        let scope = scope.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = workloads.run(scope).await {
                error!("Workload controller error: {}", e);
            }
        }));
    }

    if set.scheduler {
        let scheduler = Arc::new(DeploymentScheduler::new(Arc::clone(&store), error_backoff));
        let scope = scope.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = scheduler.run(scope).await {
                error!("Scheduler error: {}", e);
            }
        }));
    }

    if set.deployments {
        let deployments = Arc::new(DeploymentReconciler::new(Arc::clone(&store), error_backoff));
        let scope = scope.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = deployments.run(scope).await {
                error!("WorkloadDeployment controller error: {}", e);
            }
        }));
    }

    if set.instances {
        let instances = Arc::new(InstanceReconciler::new(store, error_backoff));
        handles.push(tokio::spawn(async move {
            if let Err(e) = instances.run(scope).await {
                error!("Instance controller error: {}", e);
            }
        }));
    }

    handles
}

async fn client_for_context(kubeconfig: &Kubeconfig, context: &str) -> anyhow::Result<Client> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig.clone(), &options).await?;
    Ok(Client::try_from(config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let namespace = (!args.namespace.is_empty()).then(|| args.namespace.clone());
    let error_backoff = Duration::from_secs(args.error_backoff_seconds);

    info!("Starting Workload Kubernetes Operator");
    info!("Leader election: {}", args.leader_election);
    info!("Watching namespace: {}", namespace.as_deref().unwrap_or("all"));

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Leader election: acquire lease before engaging any cluster
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns, &args.leader_election_lease_name);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let execution_clusters = args.cluster_contexts.len();
    let registry: ClusterRegistry = ClusterRegistry::new();
    registry
        .engage(LOCAL_CLUSTER, client, |client| {
            start_controllers(
                WatchScope::new(client, LOCAL_CLUSTER, namespace.clone()),
                error_backoff,
                ControllerSet::for_cluster(LOCAL_CLUSTER, execution_clusters),
            )
        })
        .await?;

    if !args.cluster_contexts.is_empty() {
        let kubeconfig = Kubeconfig::read()?;
        for context in &args.cluster_contexts {
            let cluster_client = client_for_context(&kubeconfig, context).await?;
            registry
                .engage(context, cluster_client, |client| {
                    start_controllers(
                        WatchScope::new(client, context, namespace.clone()),
                        error_backoff,
                        ControllerSet::for_cluster(context, execution_clusters),
                    )
                })
                .await?;
        }
    }

    for name in registry.names().await {
        let Some(cluster_client) = registry.client_for(&name).await else {
            continue;
        };
        match cluster_client.apiserver_version().await {
            Ok(version) => {
                info!(cluster = %name, version = %version.git_version, "Cluster reachable")
            }
            Err(e) => warn!(cluster = %name, "Cluster not reachable yet: {}", e),
        }
    }

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    registry.disengage_all().await;

    // Release the lease before exiting so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Workload Operator shutting down");
    Ok(())
}
