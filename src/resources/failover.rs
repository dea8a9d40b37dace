//! Failover and switchover through Patroni
//!
//! Patroni makes the actual HA decisions. The operator only builds
//! `patronictl` command lines and runs them inside an instance pod. Automated
//! failover is paused and resumed by rewriting the `pause` key of the DCS
//! configuration stored in the cluster's `<scope>-config` ConfigMap.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::crd::{Pgcluster, Pgtask};
use crate::resources::cluster_ops::ClusterOps;
use crate::resources::labels;

/// Key in the DCS configuration that pauses automated failover
const PAUSE_KEY: &str = "pause";

/// Build `patronictl failover --force <cluster> [--candidate <candidate>]`
pub fn generate_failover_command(cluster_name: &str, candidate: &str) -> Vec<String> {
    generate_command("failover", cluster_name, candidate)
}

/// Build `patronictl switchover --force <cluster> [--candidate <candidate>]`
pub fn generate_switchover_command(cluster_name: &str, candidate: &str) -> Vec<String> {
    generate_command("switchover", cluster_name, candidate)
}

fn generate_command(action: &str, cluster_name: &str, candidate: &str) -> Vec<String> {
    let mut cmd = vec![
        "patronictl".to_string(),
        action.to_string(),
        "--force".to_string(),
        cluster_name.to_string(),
    ];
    if !candidate.is_empty() {
        cmd.push("--candidate".to_string());
        cmd.push(candidate.to_string());
    }
    cmd
}

/// Command clearing the `primary_on_role_change` tag from the DCS configuration
pub fn remove_primary_on_role_change_command() -> Vec<String> {
    [
        "patronictl",
        "edit-config",
        "--force",
        "--set",
        "tags.primary_on_role_change=null",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Find a Running database pod of a cluster
///
/// With a non-empty `candidate` only the pods of that instance match.
pub async fn get_candidate_pod(
    ops: &dyn ClusterOps,
    namespace: &str,
    cluster_name: &str,
    candidate: &str,
) -> Result<Pod> {
    let mut selector = format!(
        "{}={},{}={}",
        labels::PG_CLUSTER,
        cluster_name,
        labels::PG_DATABASE,
        labels::TRUE
    );
    if !candidate.is_empty() {
        selector.push_str(&format!(",{}={}", labels::DEPLOYMENT_NAME, candidate));
    }
    first_running_pod(ops, namespace, &selector, candidate).await
}

/// Find the Running primary pod of a cluster
pub async fn get_primary_pod(
    ops: &dyn ClusterOps,
    namespace: &str,
    cluster_name: &str,
) -> Result<Pod> {
    let selector = format!(
        "{}={},{}={}",
        labels::PG_CLUSTER,
        cluster_name,
        labels::ROLE,
        labels::ROLE_PRIMARY
    );
    first_running_pod(ops, namespace, &selector, cluster_name).await
}

async fn first_running_pod(
    ops: &dyn ClusterOps,
    namespace: &str,
    selector: &str,
    instance: &str,
) -> Result<Pod> {
    ops.list_pods(namespace, selector, Some(labels::RUNNING_PODS))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::NoPodsFound(instance.to_string()))
}

async fn exec_patronictl(ops: &dyn ClusterOps, pod: &Pod, command: Vec<String>) -> Result<String> {
    let namespace = pod
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    debug!(pod = %pod.name_any(), ?command, "running patronictl");
    ops.exec(
        &namespace,
        &pod.name_any(),
        Some(labels::DATABASE_CONTAINER),
        command,
    )
    .await?
    .into_result()
}

/// Force a failover, optionally onto a specific instance
///
/// With a candidate the command runs in the candidate's pod and Patroni is
/// told to promote it. Without one the command runs in any Running instance
/// and Patroni picks the new primary.
pub async fn failover(
    ops: &dyn ClusterOps,
    namespace: &str,
    cluster_name: &str,
    candidate: &str,
) -> Result<()> {
    let pod = get_candidate_pod(ops, namespace, cluster_name, candidate).await?;
    let member = if candidate.is_empty() {
        String::new()
    } else {
        pod.name_any()
    };

    info!(cluster = cluster_name, candidate = %member, "failover started");
    exec_patronictl(ops, &pod, generate_failover_command(cluster_name, &member)).await?;
    info!(cluster = cluster_name, candidate = %member, "failover complete");
    Ok(())
}

/// Controlled switchover, optionally onto a specific instance
///
/// Without a candidate the command runs on the current primary.
pub async fn switchover(
    ops: &dyn ClusterOps,
    namespace: &str,
    cluster_name: &str,
    candidate: &str,
) -> Result<()> {
    let (pod, member) = if candidate.is_empty() {
        (
            get_primary_pod(ops, namespace, cluster_name).await?,
            String::new(),
        )
    } else {
        let pod = get_candidate_pod(ops, namespace, cluster_name, candidate).await?;
        let member = pod.name_any();
        (pod, member)
    };

    exec_patronictl(ops, &pod, generate_switchover_command(cluster_name, &member)).await?;
    info!(cluster = cluster_name, candidate = %member, "switchover complete");
    Ok(())
}

/// Clear the `primary_on_role_change` tag from the cluster configuration
pub async fn remove_primary_on_role_change_tag(
    ops: &dyn ClusterOps,
    namespace: &str,
    cluster_name: &str,
) -> Result<()> {
    let pod = get_primary_pod(ops, namespace, cluster_name).await?;
    exec_patronictl(ops, &pod, remove_primary_on_role_change_command()).await?;
    debug!(cluster = cluster_name, "removed primary_on_role_change tag");
    Ok(())
}

/// Rewrite the DCS configuration JSON to pause or resume automated failover
///
/// Returns `None` when the configuration already has the requested setting.
/// Any `pause` value other than `true` counts as not paused.
pub fn set_autofailover(config: &str, enable: bool) -> Result<Option<String>> {
    let mut value: Value = serde_json::from_str(config)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::ValidationError("DCS configuration is not a JSON object".into()))?;

    let paused = object.get(PAUSE_KEY) == Some(&Value::Bool(true));
    if enable == !paused {
        return Ok(None);
    }

    if enable {
        object.remove(PAUSE_KEY);
    } else {
        object.insert(PAUSE_KEY.to_string(), Value::Bool(true));
    }

    Ok(Some(serde_json::to_string(&value)?))
}

/// Enable or disable automated failover for a cluster
pub async fn toggle_autofailover(
    ops: &dyn ClusterOps,
    cluster: &Pgcluster,
    enable: bool,
) -> Result<()> {
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = labels::patroni_config_map_name(&cluster.pgha_scope());

    let mut config_map = ops
        .get_config_map(&namespace, &name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("configmap {}/{}", namespace, name)))?;

    let annotations = config_map.metadata.annotations.get_or_insert_default();
    let current = annotations
        .get(labels::ANNOTATION_PATRONI_CONFIG)
        .ok_or_else(|| Error::MissingConfigAnnotation(name.clone()))?;

    let Some(updated) = set_autofailover(current, enable)? else {
        debug!(configmap = %name, enable, "automated failover already in requested state");
        return Ok(());
    };
    annotations.insert(labels::ANNOTATION_PATRONI_CONFIG.to_string(), updated);

    ops.replace_config_map(&namespace, &config_map).await?;
    info!(cluster = %cluster.name_any(), enable, "toggled automated failover");
    Ok(())
}

/// Failover requested through a Pgtask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverRequest {
    pub namespace: String,
    pub cluster_name: String,
    /// Instance to promote; empty lets Patroni choose
    pub target: String,
}

impl FailoverRequest {
    /// Read the cluster and target from the `pg-cluster` and `target` labels
    pub fn from_task(task: &Pgtask) -> Result<Self> {
        let namespace = task
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let task_labels = task.labels();
        let cluster_name = task_labels
            .get(labels::PG_CLUSTER)
            .filter(|c| !c.is_empty())
            .cloned()
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "failover task {} has no {} label",
                    task.name_any(),
                    labels::PG_CLUSTER
                ))
            })?;
        let target = task_labels.get(labels::TARGET).cloned().unwrap_or_default();

        Ok(Self {
            namespace,
            cluster_name,
            target,
        })
    }
}
