//! Deployment and Service generation for replica instances
//!
//! Every replica runs as a single-pod Deployment named after the replica. All
//! replicas of a cluster are published through one `<cluster>-replica`
//! Service.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, PodAffinityTerm, PodAntiAffinity,
    PodSecurityContext, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec as K8sServiceSpec, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;

use crate::controller::error::{Error, Result};
use crate::crd::{
    Pgcluster, Pgreplica, PodAntiAffinityType, ServiceType, Toleration, to_k8s_tolerations,
};
use crate::resources::labels;
use crate::resources::storage::StorageResult;

/// Default PostgreSQL port when the cluster does not specify one
const DEFAULT_PORT: i32 = 5432;
/// Name of the data volume in instance pods
const PGDATA_VOLUME: &str = "pgdata";
/// Group owning the data directory in the PostgreSQL images
const POSTGRES_FS_GROUP: i64 = 26;
/// Weight of the preferred anti-affinity term
const PREFERRED_ANTI_AFFINITY_WEIGHT: i32 = 1;
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Resolve the service type for the replica service
///
/// Precedence: the replica's serviceType, its `service-type` user label, the
/// cluster's serviceType, the cluster's `service-type` user label, and finally
/// the operator default. Unparseable labels are skipped.
pub fn replica_service_type(
    replica: &Pgreplica,
    cluster: &Pgcluster,
    default: ServiceType,
) -> ServiceType {
    let from_label = |user_labels: &BTreeMap<String, String>| {
        user_labels
            .get(labels::SERVICE_TYPE)
            .and_then(|v| v.parse::<ServiceType>().ok())
    };

    replica
        .spec
        .service_type
        .or_else(|| from_label(&replica.spec.user_labels))
        .or(cluster.spec.service_type)
        .or_else(|| from_label(&cluster.spec.user_labels))
        .unwrap_or(default)
}

/// PostgreSQL port of a cluster
pub fn cluster_port(cluster: &Pgcluster) -> Result<i32> {
    let port = cluster.spec.port.trim();
    if port.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    port.parse::<i32>()
        .map_err(|_| Error::ValidationError(format!("invalid port {:?}", cluster.spec.port)))
}

/// Generate the `<cluster>-replica` Service
pub fn generate_replica_service(cluster: &Pgcluster, service_type: ServiceType) -> Result<Service> {
    let cluster_name = cluster.name_any();
    let name = labels::replica_service_name(&cluster_name);
    let port = cluster_port(cluster)?;

    let service_labels = BTreeMap::from([
        (labels::PG_CLUSTER.to_string(), cluster_name.clone()),
        (labels::NAME.to_string(), name.clone()),
        (labels::VENDOR.to_string(), labels::VENDOR_VALUE.to_string()),
    ]);

    // Patroni sets the role label on replica pods
    let selector = BTreeMap::from([
        (labels::PG_CLUSTER.to_string(), cluster_name),
        (labels::ROLE.to_string(), labels::ROLE_REPLICA.to_string()),
    ]);

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(service_labels),
            ..Default::default()
        },
        spec: Some(K8sServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("postgres".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some(service_type.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Labels carried by a replica Deployment and its pods
///
/// User labels from the cluster and the replica are copied first so that the
/// operator-owned labels always win.
pub fn replica_labels(replica: &Pgreplica, cluster: &Pgcluster) -> BTreeMap<String, String> {
    let cluster_name = replica.spec.cluster_name.clone();
    let service_name = labels::replica_service_name(&cluster_name);

    let mut result = cluster.spec.user_labels.clone();
    result.extend(replica.spec.user_labels.clone());
    result.extend([
        (labels::REPLICA_NAME.to_string(), replica.spec.name.clone()),
        (labels::DEPLOYMENT_NAME.to_string(), replica.spec.name.clone()),
        (labels::NAME.to_string(), service_name.clone()),
        (labels::SERVICE_NAME.to_string(), service_name),
        (labels::PG_CLUSTER.to_string(), cluster_name),
        (labels::PG_DATABASE.to_string(), labels::TRUE.to_string()),
        (labels::PGHA_SCOPE.to_string(), cluster.pgha_scope()),
        (labels::VENDOR.to_string(), labels::VENDOR_VALUE.to_string()),
    ]);
    result
}

/// Tolerations applied to a replica: its own, or the cluster's when it has none
pub fn effective_tolerations<'a>(
    replica: &'a Pgreplica,
    cluster: &'a Pgcluster,
) -> &'a [Toleration] {
    if replica.spec.tolerations.is_empty() {
        &cluster.spec.tolerations
    } else {
        &replica.spec.tolerations
    }
}

/// Generate pod anti-affinity keeping the instances of a cluster on separate nodes
pub fn generate_pod_anti_affinity(
    kind: PodAntiAffinityType,
    cluster_name: &str,
) -> Option<PodAntiAffinity> {
    let term = PodAffinityTerm {
        label_selector: Some(LabelSelector {
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: labels::VENDOR.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![labels::VENDOR_VALUE.to_string()]),
                },
                LabelSelectorRequirement {
                    key: labels::PG_CLUSTER.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![cluster_name.to_string()]),
                },
            ]),
            ..Default::default()
        }),
        topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
        ..Default::default()
    };

    match kind {
        PodAntiAffinityType::Disabled | PodAntiAffinityType::Unset => None,
        PodAntiAffinityType::Required => Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![term]),
            ..Default::default()
        }),
        PodAntiAffinityType::Preferred => Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: PREFERRED_ANTI_AFFINITY_WEIGHT,
                    pod_affinity_term: term,
                },
            ]),
            ..Default::default()
        }),
    }
}

/// Anti-affinity type for a cluster's instances
///
/// The `pg-pod-anti-affinity` user label overrides the cluster spec; an unset
/// value falls back to the operator default.
pub fn cluster_anti_affinity_type(
    cluster: &Pgcluster,
    default: PodAntiAffinityType,
) -> Result<PodAntiAffinityType> {
    let from_spec = cluster.spec.pod_anti_affinity.default;
    let kind = match cluster.spec.user_labels.get(labels::POD_ANTI_AFFINITY) {
        Some(value) => value.parse::<PodAntiAffinityType>()?.or(from_spec),
        None => from_spec,
    };
    Ok(kind.or(default))
}

/// Combined node affinity and pod anti-affinity for a replica
pub fn replica_affinity(
    replica: &Pgreplica,
    cluster: &Pgcluster,
    default_anti_affinity: PodAntiAffinityType,
) -> Result<Option<Affinity>> {
    let mut affinity = replica
        .spec
        .node_affinity
        .as_ref()
        .map(|n| n.to_affinity())
        .unwrap_or_default();

    let kind = cluster_anti_affinity_type(cluster, default_anti_affinity)?;
    affinity.pod_anti_affinity = generate_pod_anti_affinity(kind, &replica.spec.cluster_name);

    if affinity.node_affinity.is_none() && affinity.pod_anti_affinity.is_none() {
        Ok(None)
    } else {
        Ok(Some(affinity))
    }
}

/// Container image for a replica
fn replica_image(replica: &Pgreplica, cluster: &Pgcluster) -> String {
    let tag = replica
        .spec
        .user_labels
        .get(labels::CCP_IMAGE_TAG)
        .filter(|t| !t.is_empty())
        .unwrap_or(&cluster.spec.ccp_image_tag);

    if cluster.spec.ccp_image_prefix.is_empty() {
        format!("{}:{}", cluster.spec.ccp_image, tag)
    } else {
        format!("{}/{}:{}", cluster.spec.ccp_image_prefix, cluster.spec.ccp_image, tag)
    }
}

/// Generate the Deployment running a replica
pub fn generate_replica_deployment(
    replica: &Pgreplica,
    cluster: &Pgcluster,
    storage: &StorageResult,
    default_anti_affinity: PodAntiAffinityType,
) -> Result<Deployment> {
    let name = replica.spec.name.clone();
    let port = cluster_port(cluster)?;
    let deployment_labels = replica_labels(replica, cluster);

    let selector = BTreeMap::from([
        (labels::PG_CLUSTER.to_string(), replica.spec.cluster_name.clone()),
        (labels::DEPLOYMENT_NAME.to_string(), name.clone()),
    ]);

    let env = vec![
        EnvVar {
            name: "PGHA_SCOPE".to_string(),
            value: Some(cluster.pgha_scope()),
            ..Default::default()
        },
        EnvVar {
            name: "PGHA_PG_PORT".to_string(),
            value: Some(port.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "PGDATA_PATH".to_string(),
            value: Some(name.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "PGHA_TLS_ENABLED".to_string(),
            value: Some(cluster.spec.tls.is_enabled().to_string()),
            ..Default::default()
        },
    ];

    let container = Container {
        name: labels::DATABASE_CONTAINER.to_string(),
        image: Some(replica_image(replica, cluster)),
        ports: Some(vec![ContainerPort {
            container_port: port,
            name: Some("postgres".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount {
            name: PGDATA_VOLUME.to_string(),
            mount_path: labels::PGDATA_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let tolerations = to_k8s_tolerations(effective_tolerations(replica, cluster));

    let security_context = PodSecurityContext {
        fs_group: Some(POSTGRES_FS_GROUP),
        supplemental_groups: Some(storage.supplemental_groups.clone())
            .filter(|g| !g.is_empty()),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(deployment_labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            // Two pods must never mount the same data volume
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(deployment_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![storage.volume(PGDATA_VOLUME)]),
                    tolerations: Some(tolerations).filter(|t| !t.is_empty()),
                    affinity: replica_affinity(replica, cluster, default_anti_affinity)?,
                    security_context: Some(security_context),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
