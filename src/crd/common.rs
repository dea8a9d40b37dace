//! Types shared by the cluster, replica and task resources
//!
//! Stringly-typed fields from the API (anti-affinity, storage types, service
//! types) are decoded into closed enums here so that the rest of the operator
//! never has to re-parse them.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PreferredSchedulingTerm, Toleration as K8sToleration,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while decoding enumerated fields
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("no backrest storage types were specified")]
    StorageTypesEmpty,

    #[error("invalid backrest storage type {0:?}; valid values are 'posix', 's3' or 'gcs'")]
    InvalidStorageType(String),

    #[error(
        "invalid pod anti-affinity type {0:?}; valid values are 'required', 'preferred' or 'disabled'"
    )]
    InvalidAntiAffinityType(String),

    #[error("invalid service type {0:?}; valid values are ClusterIP, NodePort or LoadBalancer")]
    InvalidServiceType(String),
}

/// How the storage for a volume is provisioned
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Create a claim against the given storage class
    Create,
    /// Create a claim using dynamic provisioning
    #[default]
    Dynamic,
    /// Reuse an existing claim by name
    Existing,
    /// Use an emptyDir volume (no persistence)
    EmptyDir,
}

/// Storage settings for a PostgreSQL data volume
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub struct PgStorageSpec {
    /// Name of the claim backing this volume (filled in by the operator)
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub storageclass: String,

    /// Access mode of the claim (e.g., "ReadWriteOnce")
    #[serde(default)]
    pub accessmode: String,

    /// Requested size as a Kubernetes quantity (e.g., "1Gi")
    #[serde(default)]
    pub size: String,

    #[serde(default)]
    pub storagetype: StorageType,

    #[serde(default)]
    pub supplementalgroups: String,

    #[serde(default, rename = "matchLabels")]
    pub match_labels: String,
}

/// Pod toleration
///
/// Mirrors the core Kubernetes type so the CRD schema stays self-contained.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// "Exists" or "Equal"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// "NoSchedule", "PreferNoSchedule" or "NoExecute"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

impl From<&Toleration> for K8sToleration {
    fn from(t: &Toleration) -> Self {
        K8sToleration {
            key: t.key.clone(),
            operator: t.operator.clone(),
            value: t.value.clone(),
            effect: t.effect.clone(),
            toleration_seconds: t.toleration_seconds,
        }
    }
}

/// Convert a list of tolerations into the core Kubernetes type
pub fn to_k8s_tolerations(tolerations: &[Toleration]) -> Vec<K8sToleration> {
    tolerations.iter().map(K8sToleration::from).collect()
}

/// Whether a node affinity rule must hold or is only preferred
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeAffinityType {
    #[default]
    Preferred,
    Required,
}

/// Node affinity for an instance, expressed as a single label rule
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinitySpec {
    /// Node label key
    pub key: String,

    /// Node label values; the rule matches when the label has any of them
    #[serde(default)]
    pub values: Vec<String>,

    /// Invert the match ("NotIn" instead of "In")
    #[serde(default)]
    pub negate: bool,

    #[serde(default, rename = "type")]
    pub type_: NodeAffinityType,
}

/// Weight given to preferred node affinity terms
const PREFERRED_NODE_AFFINITY_WEIGHT: i32 = 10;

impl NodeAffinitySpec {
    /// Build the pod affinity for this rule
    pub fn to_affinity(&self) -> Affinity {
        let operator = if self.negate { "NotIn" } else { "In" };
        let term = NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: self.key.clone(),
                operator: operator.to_string(),
                values: Some(self.values.clone()),
            }]),
            ..Default::default()
        };

        let node_affinity = match self.type_ {
            NodeAffinityType::Required => NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![term],
                }),
                ..Default::default()
            },
            NodeAffinityType::Preferred => NodeAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(vec![
                    PreferredSchedulingTerm {
                        preference: term,
                        weight: PREFERRED_NODE_AFFINITY_WEIGHT,
                    },
                ]),
                ..Default::default()
            },
        };

        Affinity {
            node_affinity: Some(node_affinity),
            ..Default::default()
        }
    }
}

/// Kubernetes Service type used for instance services
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
        }
    }
}

impl FromStr for ServiceType {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ClusterIP" => Ok(ServiceType::ClusterIP),
            "NodePort" => Ok(ServiceType::NodePort),
            "LoadBalancer" => Ok(ServiceType::LoadBalancer),
            other => Err(FieldError::InvalidServiceType(other.to_string())),
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pod anti-affinity policy
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum PodAntiAffinityType {
    #[serde(rename = "required")]
    Required,
    #[serde(rename = "preferred")]
    Preferred,
    #[serde(rename = "disabled")]
    Disabled,
    /// Not set; the operator default applies
    #[default]
    #[serde(rename = "")]
    Unset,
}

impl PodAntiAffinityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodAntiAffinityType::Required => "required",
            PodAntiAffinityType::Preferred => "preferred",
            PodAntiAffinityType::Disabled => "disabled",
            PodAntiAffinityType::Unset => "",
        }
    }

    /// Resolve an unset value against a fallback
    pub fn or(self, fallback: PodAntiAffinityType) -> PodAntiAffinityType {
        match self {
            PodAntiAffinityType::Unset => fallback,
            other => other,
        }
    }
}

impl FromStr for PodAntiAffinityType {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "required" => Ok(PodAntiAffinityType::Required),
            "preferred" => Ok(PodAntiAffinityType::Preferred),
            "disabled" => Ok(PodAntiAffinityType::Disabled),
            "" => Ok(PodAntiAffinityType::Unset),
            other => Err(FieldError::InvalidAntiAffinityType(other.to_string())),
        }
    }
}

/// Anti-affinity settings per deployment kind
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodAntiAffinitySpec {
    #[serde(default)]
    pub default: PodAntiAffinityType,

    #[serde(default, rename = "pgBackRest")]
    pub pg_backrest: PodAntiAffinityType,

    #[serde(default)]
    pub pg_bouncer: PodAntiAffinityType,
}

/// pgBackRest repository storage backend
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackrestStorageType {
    Posix,
    S3,
    Gcs,
}

impl BackrestStorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackrestStorageType::Posix => "posix",
            BackrestStorageType::S3 => "s3",
            BackrestStorageType::Gcs => "gcs",
        }
    }
}

impl FromStr for BackrestStorageType {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            // "local" is the legacy name for a posix repository
            "posix" | "local" => Ok(BackrestStorageType::Posix),
            "s3" => Ok(BackrestStorageType::S3),
            "gcs" => Ok(BackrestStorageType::Gcs),
            other => Err(FieldError::InvalidStorageType(other.to_string())),
        }
    }
}

/// Parse a comma-separated list of pgBackRest storage types
///
/// Duplicates (including "local" alongside "posix") collapse into one entry.
pub fn parse_backrest_storage_types(value: &str) -> Result<Vec<BackrestStorageType>, FieldError> {
    if value.trim().is_empty() {
        return Err(FieldError::StorageTypesEmpty);
    }

    let mut types = Vec::new();
    for part in value.split(',') {
        let storage_type: BackrestStorageType = part.parse()?;
        if !types.contains(&storage_type) {
            types.push(storage_type);
        }
    }
    Ok(types)
}

/// TLS configuration for a cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TLSSpec {
    /// Secret holding the CA certificate (`ca.crt`)
    #[serde(default)]
    pub ca_secret: String,

    /// Secret holding the certificate used for replication connections
    #[serde(default, rename = "replicationTLSSecret")]
    pub replication_tls_secret: String,

    /// Secret holding the server key pair
    #[serde(default, rename = "tlsSecret")]
    pub tls_secret: String,
}

impl TLSSpec {
    /// TLS is enabled only when both the server and CA secrets are set
    pub fn is_enabled(&self) -> bool {
        !self.tls_secret.is_empty() && !self.ca_secret.is_empty()
    }
}

/// Free-form labels that are copied onto the objects an instance owns
pub type UserLabels = BTreeMap<String, String>;
