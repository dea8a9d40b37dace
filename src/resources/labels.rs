//! Label, annotation and naming conventions shared with the rest of the
//! PostgreSQL tooling (Patroni, pgBackRest, the CLI)

/// Cluster an object belongs to
pub const PG_CLUSTER: &str = "pg-cluster";
/// Marks pods that run a PostgreSQL instance
pub const PG_DATABASE: &str = "pgo-pg-database";
pub const REPLICA_NAME: &str = "replica-name";
pub const DEPLOYMENT_NAME: &str = "deployment-name";
/// Service an instance is published under; equals the cluster name on the primary
pub const SERVICE_NAME: &str = "service-name";
pub const SERVICE_TYPE: &str = "service-type";
pub const NAME: &str = "name";
pub const PGOUSER: &str = "pgouser";
/// Patroni role label set on instance pods
pub const ROLE: &str = "role";
pub const ROLE_PRIMARY: &str = "master";
pub const ROLE_REPLICA: &str = "replica";
/// Patroni scope of a cluster
pub const PGHA_SCOPE: &str = "crunchy-pgha-scope";
pub const VENDOR: &str = "vendor";
pub const VENDOR_VALUE: &str = "crunchydata";
/// Failover target carried on failover tasks
pub const TARGET: &str = "target";
pub const TRUE: &str = "true";
/// Per-instance override of the container image tag
pub const CCP_IMAGE_TAG: &str = "ccp-image-tag";
/// Per-cluster override of the pod anti-affinity type
pub const POD_ANTI_AFFINITY: &str = "pg-pod-anti-affinity";

/// Set on a replica when its size is changed by a cluster-wide resize, so the
/// replica controller does not resize it a second time
pub const ANNOTATION_DO_NOT_RESIZE: &str = "pgo-pvc-do-not-resize";
/// ConfigMap annotation carrying the Patroni DCS configuration as JSON
pub const ANNOTATION_PATRONI_CONFIG: &str = "config";

/// Container running PostgreSQL in instance pods
pub const DATABASE_CONTAINER: &str = "database";
/// Mount path of the PostgreSQL data volume
pub const PGDATA_MOUNT_PATH: &str = "/pgdata";

/// Field manager used for patches
pub const FIELD_MANAGER: &str = "postgres-operator";

/// Name of the Service that fronts the replicas of a cluster
pub fn replica_service_name(cluster_name: &str) -> String {
    format!("{}-replica", cluster_name)
}

/// Name of the ConfigMap holding the Patroni DCS configuration
pub fn patroni_config_map_name(scope: &str) -> String {
    format!("{}-config", scope)
}

/// Label selector for the database pods of a cluster
pub fn database_selector(cluster_name: &str) -> String {
    format!("{}={},{}", PG_CLUSTER, cluster_name, PG_DATABASE)
}

/// Field selector matching only Running pods
pub const RUNNING_PODS: &str = "status.phase=Running";
