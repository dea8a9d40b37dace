use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{NodeAffinitySpec, PgStorageSpec, ServiceType, Toleration, UserLabels};

/// Value of `spec.status` once the replica has been provisioned
pub const COMPLETED_STATUS: &str = "complete";

/// Pgreplica describes one read replica of a Pgcluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "crunchydata.com",
    version = "v1",
    kind = "Pgreplica",
    plural = "pgreplicas",
    namespaced,
    status = "PgreplicaStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clustername"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct PgreplicaSpec {
    #[serde(default)]
    pub namespace: String,

    /// Instance name; also the name of the backing Deployment and PVC
    pub name: String,

    /// Owning Pgcluster
    #[serde(rename = "clustername")]
    pub cluster_name: String,

    #[serde(default, rename = "replicastorage")]
    pub replica_storage: PgStorageSpec,

    /// Overrides the cluster service type for the replica service
    #[serde(default, rename = "serviceType", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,

    /// Instance-specific tolerations; when set, cluster tolerations are not applied
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default, rename = "nodeAffinity", skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinitySpec>,

    #[serde(default, rename = "userlabels")]
    pub user_labels: UserLabels,

    /// Set to "complete" by the operator once the Deployment exists
    #[serde(default)]
    pub status: String,
}

/// Observed state of a Pgreplica
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PgreplicaStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ReplicaState>,

    #[serde(default)]
    pub message: String,
}

/// Replica lifecycle state
///
/// States written by other tools deserialize as `Unknown`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ReplicaState {
    #[serde(rename = "pgreplica Created")]
    Created,
    #[serde(rename = "pgreplica Pending init")]
    PendingInit,
    #[serde(rename = "pgreplica Pending restore")]
    PendingRestore,
    #[serde(rename = "pgreplica Processed")]
    Processed,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Created => write!(f, "pgreplica Created"),
            ReplicaState::PendingInit => write!(f, "pgreplica Pending init"),
            ReplicaState::PendingRestore => write!(f, "pgreplica Pending restore"),
            ReplicaState::Processed => write!(f, "pgreplica Processed"),
            ReplicaState::Unknown => write!(f, "unknown"),
        }
    }
}

impl PgreplicaStatus {
    pub fn processed() -> Self {
        Self {
            state: Some(ReplicaState::Processed),
            message: "Successfully processed Pgreplica by controller".to_string(),
        }
    }

    pub fn pending_init() -> Self {
        Self {
            state: Some(ReplicaState::PendingInit),
            message: "Pgreplica processing pending the creation of the initial backup"
                .to_string(),
        }
    }
}

impl Pgreplica {
    pub fn state(&self) -> Option<ReplicaState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    /// Whether the controller already processed this replica
    pub fn is_processed(&self) -> bool {
        self.state() == Some(ReplicaState::Processed)
    }

    /// Whether the replica Deployment has been provisioned
    pub fn is_complete(&self) -> bool {
        self.spec.status == COMPLETED_STATUS
    }
}
