pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, ClusterHandler, Context, Error, Informer, ReplicaController,
    ResourceEventHandler, Result, TaskHandler, WorkQueue,
};
pub use crd::{Pgcluster, Pgreplica, Pgtask};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// CRD manifests of all custom resources as a multi-document YAML stream
pub fn crd_manifests() -> Result<String, serde_yaml::Error> {
    let crds = [Pgcluster::crd(), Pgreplica::crd(), Pgtask::crd()];
    let mut out = String::new();
    for crd in &crds {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(crd)?);
    }
    Ok(out)
}

/// Run the replica controller plus the cluster and task handlers until `token`
/// is cancelled.
///
/// Pgreplica events feed the replica work queue drained by
/// `config.worker_count()` workers. Pgcluster and Pgtask events are handled
/// inline by their informers. When `config.namespace` is empty all namespaces
/// are watched.
pub async fn run_operator(
    client: Client,
    config: Arc<OperatorConfig>,
    health_state: Option<Arc<HealthState>>,
    token: CancellationToken,
) {
    let namespace = config.watch_namespace().map(str::to_string);
    tracing::info!(
        "Starting replica controller (scope: {})",
        namespace.as_deref().unwrap_or("cluster-wide")
    );

    let ctx = Arc::new(Context::new(
        client.clone(),
        config.clone(),
        health_state.clone(),
    ));
    let replicas = Arc::new(ReplicaController::new(ctx.clone()));
    let clusters = Arc::new(ClusterHandler::new(ctx.clone()));
    let tasks = Arc::new(TaskHandler::new(ctx));

    let replica_api: Api<Pgreplica> = scoped_api(client.clone(), namespace.as_deref());
    let cluster_api: Api<Pgcluster> = scoped_api(client.clone(), namespace.as_deref());
    let task_api: Api<Pgtask> = scoped_api(client, namespace.as_deref());

    // Mark as ready once the informers and workers are started
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let replica_informer =
        Informer::new(replicas.clone()).run(replica_api, WatcherConfig::default(), token.clone());
    let cluster_informer =
        Informer::new(clusters).run(cluster_api, WatcherConfig::default(), token.clone());
    let task_informer = Informer::new(tasks).run(task_api, WatcherConfig::default(), token.clone());
    let workers = replicas.run(config.worker_count(), token);

    tokio::join!(replica_informer, cluster_informer, task_informer, workers);

    tracing::info!("Replica controller stopped");
}
