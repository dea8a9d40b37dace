//! Replication status of the instances of a cluster
//!
//! Patroni is asked for the member list from inside any Running instance
//! (`patronictl list -f json`) and the rows are joined with the pods found by
//! label selector to name each instance and its node.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::controller::error::Result;
use crate::resources::cluster_ops::ClusterOps;
use crate::resources::labels;

const PATRONI_LEADER: &str = "Leader";
const PATRONI_STANDBY_LEADER: &str = "Standby Leader";

pub const ROLE_PRIMARY: &str = "primary";
pub const ROLE_REPLICA: &str = "replica";
const ROLE_UNKNOWN: &str = "unknown";
const STATUS_UNAVAILABLE: &str = "unavailable";

/// Lag and timeline reported for instances Patroni has no state for
pub const UNAVAILABLE: i64 = -1;

/// Replication state of one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReplicationInfo {
    /// Instance (Deployment) name
    pub name: String,
    pub node: String,
    /// Lag behind the leader in MB
    pub replication_lag: i64,
    pub status: String,
    pub timeline: i64,
    pub pending_restart: bool,
    pub pod_name: String,
    pub role: String,
}

/// One row of `patronictl list -f json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PatroniMember {
    #[serde(rename = "Member", default)]
    pub member: String,
    #[serde(rename = "Role", default)]
    pub role: String,
    #[serde(rename = "Lag in MB", default, deserialize_with = "lenient_int")]
    pub lag_in_mb: i64,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "TL", default, deserialize_with = "lenient_int")]
    pub timeline: i64,
    #[serde(rename = "Pending restart", default)]
    pub pending_restart: String,
}

impl PatroniMember {
    fn is_leader(&self) -> bool {
        self.role == PATRONI_LEADER || self.role == PATRONI_STANDBY_LEADER
    }
}

/// Patroni leaves numeric columns blank for some members; those read as 0
fn lenient_int<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_i64().unwrap_or_default())
}

#[derive(Debug, Clone, Default)]
struct InstanceInfo {
    name: String,
    node: String,
}

/// Label selector for the pods taking part in replication status
///
/// Without the primary, "busted" pods (no role label) are kept only when
/// `include_busted` is set.
pub fn replication_selector(cluster_name: &str, include_primary: bool, include_busted: bool) -> String {
    let mut selector = labels::database_selector(cluster_name);
    if !include_primary {
        if include_busted {
            selector.push_str(&format!(",{}!={}", labels::ROLE, labels::ROLE_PRIMARY));
        } else {
            selector.push_str(&format!(",{}={}", labels::ROLE, labels::ROLE_REPLICA));
        }
    }
    selector
}

fn instance_info_map(pods: &[Pod]) -> HashMap<String, InstanceInfo> {
    pods.iter()
        .map(|pod| {
            let info = InstanceInfo {
                name: pod
                    .labels()
                    .get(labels::DEPLOYMENT_NAME)
                    .cloned()
                    .unwrap_or_default(),
                node: pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.clone())
                    .unwrap_or_default(),
            };
            (pod.name_any(), info)
        })
        .collect()
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

/// Records for every pod when none of them can be asked
pub fn unavailable_instances(pods: &[Pod]) -> Vec<InstanceReplicationInfo> {
    let info = instance_info_map(pods);
    pods.iter()
        .map(|pod| {
            let instance = info.get(&pod.name_any()).cloned().unwrap_or_default();
            InstanceReplicationInfo {
                name: instance.name,
                node: instance.node,
                replication_lag: UNAVAILABLE,
                status: STATUS_UNAVAILABLE.to_string(),
                timeline: UNAVAILABLE,
                pending_restart: false,
                pod_name: String::new(),
                role: ROLE_UNKNOWN.to_string(),
            }
        })
        .collect()
}

/// Parse `patronictl list -f json` output; unreadable output yields no rows
pub fn parse_members(output: &str) -> Vec<PatroniMember> {
    serde_json::from_str(output).unwrap_or_else(|e| {
        debug!(error = %e, "could not parse patroni member list");
        Vec::new()
    })
}

/// Turn Patroni member rows into replication records for the given pods
pub fn instances_from_members(
    members: Vec<PatroniMember>,
    pods: &[Pod],
    include_primary: bool,
    include_busted: bool,
) -> Vec<InstanceReplicationInfo> {
    let info = instance_info_map(pods);

    members
        .into_iter()
        .filter(|m| include_primary || !m.is_leader())
        .filter(|m| include_busted || !m.state.is_empty())
        .map(|m| {
            let instance = info.get(&m.member).cloned().unwrap_or_default();
            let role = if m.is_leader() { ROLE_PRIMARY } else { ROLE_REPLICA };
            let mut record = InstanceReplicationInfo {
                name: instance.name,
                node: instance.node,
                replication_lag: m.lag_in_mb,
                status: m.state.clone(),
                timeline: m.timeline,
                pending_restart: m.pending_restart == "*",
                pod_name: m.member,
                role: role.to_string(),
            };
            if m.state.is_empty() {
                record.status = STATUS_UNAVAILABLE.to_string();
                record.replication_lag = UNAVAILABLE;
                record.timeline = UNAVAILABLE;
            }
            record
        })
        .collect()
}

/// Collects the replication state of one cluster
pub struct ReplicationStatusCollector<'a> {
    ops: &'a dyn ClusterOps,
    namespace: String,
    cluster_name: String,
}

impl<'a> ReplicationStatusCollector<'a> {
    pub fn new(ops: &'a dyn ClusterOps, namespace: &str, cluster_name: &str) -> Self {
        Self {
            ops,
            namespace: namespace.to_string(),
            cluster_name: cluster_name.to_string(),
        }
    }

    /// Replication state of the cluster's instances
    ///
    /// If none of the selected pods is Running, every pod is reported as
    /// unavailable without asking Patroni.
    #[instrument(skip(self), fields(namespace = %self.namespace, cluster = %self.cluster_name))]
    pub async fn collect(
        &self,
        include_primary: bool,
        include_busted: bool,
    ) -> Result<Vec<InstanceReplicationInfo>> {
        let selector = replication_selector(&self.cluster_name, include_primary, include_busted);
        debug!(%selector, "searching for instance pods");
        let pods = self.ops.list_pods(&self.namespace, &selector, None).await?;
        debug!(count = pods.len(), "instance pods found");

        if pods.is_empty() {
            return Ok(Vec::new());
        }

        let Some(pod) = pods.iter().find(|p| is_running(p)) else {
            return Ok(unavailable_instances(&pods));
        };

        let container = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone());
        let output = self
            .ops
            .exec(
                &self.namespace,
                &pod.name_any(),
                container.as_deref(),
                list_command(),
            )
            .await?;

        let members = parse_members(&output.stdout);
        debug!(?members, "patroni member info");
        Ok(instances_from_members(
            members,
            &pods,
            include_primary,
            include_busted,
        ))
    }
}

/// `patronictl list -f json`
pub fn list_command() -> Vec<String> {
    ["patronictl", "list", "-f", "json"]
        .into_iter()
        .map(String::from)
        .collect()
}
