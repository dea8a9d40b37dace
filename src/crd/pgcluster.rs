use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    BackrestStorageType, PgStorageSpec, PodAntiAffinitySpec, ServiceType, TLSSpec, Toleration,
    UserLabels,
};

/// Pgcluster is the declarative description of a PostgreSQL cluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "crunchydata.com",
    version = "v1",
    kind = "Pgcluster",
    plural = "pgclusters",
    namespaced,
    status = "PgclusterStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct PgclusterSpec {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, rename = "clustername")]
    pub cluster_name: String,

    #[serde(default, rename = "ccpimage")]
    pub ccp_image: String,

    #[serde(default, rename = "ccpimagetag")]
    pub ccp_image_tag: String,

    #[serde(default, rename = "ccpimageprefix")]
    pub ccp_image_prefix: String,

    /// PostgreSQL port
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default, rename = "PrimaryStorage")]
    pub primary_storage: PgStorageSpec,

    #[serde(default, rename = "ReplicaStorage")]
    pub replica_storage: PgStorageSpec,

    /// Requested number of replicas at creation time
    #[serde(default)]
    pub replicas: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub status: String,

    #[serde(default, rename = "userlabels")]
    pub user_labels: UserLabels,

    /// Tolerations applied to every instance without its own overrides
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default, rename = "serviceType", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,

    #[serde(default, rename = "podAntiAffinity")]
    pub pod_anti_affinity: PodAntiAffinitySpec,

    #[serde(default)]
    pub tls: TLSSpec,

    #[serde(default, rename = "tlsOnly")]
    pub tls_only: bool,

    #[serde(default)]
    pub standby: bool,

    #[serde(default)]
    pub shutdown: bool,

    #[serde(default, rename = "backrestStorageTypes")]
    pub backrest_storage_types: Vec<BackrestStorageType>,
}

fn default_port() -> String {
    "5432".to_string()
}

/// Observed state of a Pgcluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PgclusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClusterState>,

    #[serde(default)]
    pub message: String,
}

/// Cluster lifecycle state
///
/// States written by other tools deserialize as `Unknown`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClusterState {
    #[serde(rename = "pgcluster Created")]
    Created,
    #[serde(rename = "pgcluster Processed")]
    Processed,
    #[serde(rename = "pgcluster Initialized")]
    Initialized,
    #[serde(rename = "pgcluster Bootstrapping")]
    Bootstrapping,
    #[serde(rename = "pgcluster Bootstrapped")]
    Bootstrapped,
    #[serde(rename = "pgcluster Restoring")]
    Restoring,
    #[serde(rename = "pgcluster Shutdown")]
    Shutdown,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Created => write!(f, "pgcluster Created"),
            ClusterState::Processed => write!(f, "pgcluster Processed"),
            ClusterState::Initialized => write!(f, "pgcluster Initialized"),
            ClusterState::Bootstrapping => write!(f, "pgcluster Bootstrapping"),
            ClusterState::Bootstrapped => write!(f, "pgcluster Bootstrapped"),
            ClusterState::Restoring => write!(f, "pgcluster Restoring"),
            ClusterState::Shutdown => write!(f, "pgcluster Shutdown"),
            ClusterState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Name of the monitoring user, whose secret uses the exporter name
pub const PG_USER_MONITOR: &str = "ccp_monitoring";
pub const PG_USER_SUPERUSER: &str = "postgres";
pub const PG_USER_REPLICATION: &str = "primaryuser";

impl Pgcluster {
    /// Current lifecycle state, if the cluster controller has set one
    pub fn state(&self) -> Option<ClusterState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    /// Whether the cluster has finished bootstrapping and can take replicas
    pub fn is_initialized(&self) -> bool {
        self.state() == Some(ClusterState::Initialized)
    }

    /// Patroni scope of the cluster; used to name the DCS ConfigMaps
    pub fn pgha_scope(&self) -> String {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(crate::resources::labels::PGHA_SCOPE))
            .cloned()
            .unwrap_or_else(|| kube::ResourceExt::name_any(self))
    }
}

/// Name of the Secret holding the credentials of a cluster user
pub fn user_secret_name(cluster: &Pgcluster, user: &str) -> String {
    user_secret_name_from_cluster_name(&kube::ResourceExt::name_any(cluster), user)
}

/// Same as [`user_secret_name`], but from a bare cluster name
pub fn user_secret_name_from_cluster_name(cluster_name: &str, user: &str) -> String {
    if user == PG_USER_MONITOR {
        format!("{}-exporter-secret", cluster_name)
    } else {
        format!("{}-{}-secret", cluster_name, user)
    }
}
