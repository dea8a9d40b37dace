//! Data volumes for PostgreSQL instances
//!
//! [`StorageResult`] describes the volume an instance ends up with: either a
//! PersistentVolumeClaim or, when no claim name is set, an emptyDir.

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Volume, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ObjectMeta;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::validation::parse_quantity_nanos;
use crate::crd::{PgStorageSpec, StorageType};
use crate::resources::cluster_ops::ClusterOps;
use crate::resources::labels;

/// Access mode used when the storage spec does not name one
const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

/// Volume provisioned for an instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageResult {
    /// Claim backing the volume; empty means an emptyDir
    pub persistent_volume_claim_name: String,
    pub supplemental_groups: Vec<i64>,
}

impl StorageResult {
    /// Volume source as a JSON object: `{"emptyDir":{}}` or
    /// `{"persistentVolumeClaim":{"claimName":"..."}}`
    pub fn volume_source(&self) -> Value {
        let mut source = Map::new();
        if self.persistent_volume_claim_name.is_empty() {
            source.insert("emptyDir".to_string(), Value::Object(Map::new()));
        } else {
            let mut claim = Map::new();
            claim.insert(
                "claimName".to_string(),
                Value::String(self.persistent_volume_claim_name.clone()),
            );
            source.insert("persistentVolumeClaim".to_string(), Value::Object(claim));
        }
        Value::Object(source)
    }

    /// The volume source JSON without its enclosing braces, ready to be
    /// spliced into a larger volume definition
    pub fn inline_volume_source(&self) -> String {
        let json = self.volume_source().to_string();
        json.strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .map(str::to_string)
            .unwrap_or(json)
    }

    /// Build a named pod volume for this result
    pub fn volume(&self, name: &str) -> Volume {
        if self.persistent_volume_claim_name.is_empty() {
            Volume {
                name: name.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }
        } else {
            Volume {
                name: name.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: self.persistent_volume_claim_name.clone(),
                    read_only: None,
                }),
                ..Default::default()
            }
        }
    }
}

/// Parse a comma-separated list of supplemental group ids
pub fn parse_supplemental_groups(value: &str) -> Result<Vec<i64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| {
                Error::ValidationError(format!("invalid supplemental group {:?}", s))
            })
        })
        .collect()
}

/// Parse a "key=value" match label into a selector
fn match_labels_selector(match_labels: &str) -> Option<LabelSelector> {
    let (key, value) = match_labels.split_once('=')?;
    Some(LabelSelector {
        match_labels: Some(BTreeMap::from([(
            key.trim().to_string(),
            value.trim().to_string(),
        )])),
        ..Default::default()
    })
}

/// Build the data claim for an instance
pub fn instance_pvc(
    cluster_name: &str,
    claim_name: &str,
    spec: &PgStorageSpec,
) -> Result<PersistentVolumeClaim> {
    // Reject sizes the API server would refuse before we send anything
    parse_quantity_nanos(&spec.size)?;

    let access_mode = if spec.accessmode.is_empty() {
        DEFAULT_ACCESS_MODE.to_string()
    } else {
        spec.accessmode.clone()
    };

    let (storage_class_name, selector) = match spec.storagetype {
        StorageType::Create => (None, match_labels_selector(&spec.match_labels)),
        _ => (
            Some(spec.storageclass.clone()).filter(|s| !s.is_empty()),
            None,
        ),
    };

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name.to_string()),
            labels: Some(BTreeMap::from([
                (labels::PG_CLUSTER.to_string(), cluster_name.to_string()),
                (labels::VENDOR.to_string(), labels::VENDOR_VALUE.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode]),
            storage_class_name,
            selector,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(spec.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Create the data volume for an instance if it does not exist yet
///
/// emptyDir storage needs no claim. "existing" storage reuses the claim named
/// in the storage spec. "create" and "dynamic" storage get a claim named after the
/// instance.
pub async fn create_missing_replica_volume(
    ops: &dyn ClusterOps,
    namespace: &str,
    cluster_name: &str,
    instance_name: &str,
    spec: &PgStorageSpec,
) -> Result<StorageResult> {
    let supplemental_groups = parse_supplemental_groups(&spec.supplementalgroups)?;

    let claim_name = match spec.storagetype {
        StorageType::EmptyDir => {
            debug!(instance = instance_name, "using emptyDir storage");
            return Ok(StorageResult {
                persistent_volume_claim_name: String::new(),
                supplemental_groups,
            });
        }
        StorageType::Existing => {
            if spec.name.is_empty() {
                return Err(Error::ValidationError(format!(
                    "storage for {} is of type existing but names no claim",
                    instance_name
                )));
            }
            spec.name.clone()
        }
        StorageType::Create | StorageType::Dynamic => instance_name.to_string(),
    };

    if ops.get_pvc(namespace, &claim_name).await?.is_some() {
        debug!(pvc = %claim_name, "pvc already exists");
    } else if spec.storagetype == StorageType::Existing {
        return Err(Error::NotFound(format!("pvc {}/{}", namespace, claim_name)));
    } else {
        let pvc = instance_pvc(cluster_name, &claim_name, spec)?;
        ops.create_pvc(namespace, &pvc).await?;
        info!(pvc = %claim_name, size = %spec.size, "created pvc");
    }

    Ok(StorageResult {
        persistent_volume_claim_name: claim_name,
        supplemental_groups,
    })
}
