//! Operations on a running PostgreSQL instance and its Deployment

use std::future::Future;
use std::time::Duration;

use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::resources::cluster_ops::ClusterOps;
use crate::resources::labels;

/// `pg_ctl` invocation performing a fast shutdown of the instance data directory
pub fn stop_command(deployment_name: &str) -> Vec<String> {
    vec![
        "pg_ctl".to_string(),
        "stop".to_string(),
        "-m".to_string(),
        "fast".to_string(),
        "-D".to_string(),
        format!("{}/{}", labels::PGDATA_MOUNT_PATH, deployment_name),
    ]
}

/// `pg_isready` invocation checking the instance accepts connections
pub fn ready_command(port: i32) -> Vec<String> {
    vec!["pg_isready".to_string(), "-p".to_string(), port.to_string()]
}

/// Polling interval and deadline for an instance coming back up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessWait {
    pub period: Duration,
    pub timeout: Duration,
}

/// Stop PostgreSQL in the Running pod of a Deployment
///
/// A Deployment without a Running pod is treated as already stopped.
pub async fn stop_postgresql_instance(
    ops: &dyn ClusterOps,
    namespace: &str,
    deployment_name: &str,
) -> Result<()> {
    let selector = format!("{}={}", labels::DEPLOYMENT_NAME, deployment_name);
    let pods = ops
        .list_pods(namespace, &selector, Some(labels::RUNNING_PODS))
        .await?;

    let Some(pod) = pods.first() else {
        info!(
            deployment = deployment_name,
            "not shutting down PostgreSQL instance, no running pod found"
        );
        return Ok(());
    };

    let pod_name = pod.name_any();
    debug!(deployment = deployment_name, pod = %pod_name, "stopping PostgreSQL");
    ops.exec(
        namespace,
        &pod_name,
        Some(labels::DATABASE_CONTAINER),
        stop_command(deployment_name),
    )
    .await?
    .into_result()?;

    info!(deployment = deployment_name, pod = %pod_name, "stopped PostgreSQL instance");
    Ok(())
}

/// Set the replica count of a Deployment
pub async fn scale_deployment(
    ops: &dyn ClusterOps,
    namespace: &str,
    name: &str,
    replicas: i32,
) -> Result<()> {
    let patch = json!({ "spec": { "replicas": replicas } });
    ops.patch_deployment(namespace, name, &patch).await?;
    info!(deployment = name, replicas, "scaled deployment");
    Ok(())
}

/// Stop PostgreSQL and bounce the Deployment so its pod starts over
///
/// Stopping and scaling back up only warn on failure; scaling down is the one
/// step whose failure is returned.
pub async fn restart_instance(
    ops: &dyn ClusterOps,
    namespace: &str,
    deployment_name: &str,
) -> Result<()> {
    if let Err(e) = stop_postgresql_instance(ops, namespace, deployment_name).await {
        warn!(deployment = deployment_name, error = %e, "could not stop PostgreSQL");
    }
    scale_deployment(ops, namespace, deployment_name, 0).await?;
    if let Err(e) = scale_deployment(ops, namespace, deployment_name, 1).await {
        warn!(deployment = deployment_name, error = %e, "could not scale deployment back up");
    }
    Ok(())
}

/// Poll `check` every period until it reports true; false on timeout
///
/// A failing check counts as not ready yet.
async fn poll_until<F, Fut>(wait: ReadinessWait, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let polling = async {
        loop {
            match check().await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => debug!(error = %e, "readiness check failed"),
            }
            tokio::time::sleep(wait.period).await;
        }
    };
    tokio::time::timeout(wait.timeout, polling).await.is_ok()
}

/// Whether every desired pod of a Deployment is ready
pub async fn deployment_ready(ops: &dyn ClusterOps, namespace: &str, name: &str) -> Result<bool> {
    let Some(deployment) = ops.get_deployment(namespace, name).await? else {
        return Ok(false);
    };
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    Ok(desired > 0 && ready >= desired)
}

/// Whether PostgreSQL in the Running pod of a Deployment accepts connections
pub async fn postgres_ready(
    ops: &dyn ClusterOps,
    namespace: &str,
    deployment_name: &str,
    port: i32,
) -> Result<bool> {
    let selector = format!("{}={}", labels::DEPLOYMENT_NAME, deployment_name);
    let pods = ops
        .list_pods(namespace, &selector, Some(labels::RUNNING_PODS))
        .await?;
    let Some(pod) = pods.first() else {
        return Ok(false);
    };

    // pg_isready reports through its exit code and stdout, never stderr
    let output = ops
        .exec(
            namespace,
            &pod.name_any(),
            Some(labels::DATABASE_CONTAINER),
            ready_command(port),
        )
        .await?;
    Ok(output.stdout.contains("accepting connections"))
}

/// Wait for a Deployment to be ready and then for PostgreSQL to accept connections
pub async fn wait_for_instance_ready(
    ops: &dyn ClusterOps,
    namespace: &str,
    deployment_name: &str,
    port: i32,
    wait: ReadinessWait,
) -> Result<()> {
    if !poll_until(wait, || deployment_ready(ops, namespace, deployment_name)).await {
        return Err(Error::Timeout(format!(
            "deployment {} to become ready",
            deployment_name
        )));
    }
    if !poll_until(wait, || postgres_ready(ops, namespace, deployment_name, port)).await {
        return Err(Error::Timeout(format!(
            "PostgreSQL instance {} to accept connections",
            deployment_name
        )));
    }
    debug!(deployment = deployment_name, "instance is ready");
    Ok(())
}
