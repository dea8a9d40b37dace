//! PVC resize of replica instances
//!
//! Most storage provisioners only grow a claim while nothing has it mounted,
//! so a resize updates the claim and then bounces the instance. The sequence
//! is not transactional: a failure after the claim was updated leaves the
//! Deployment scaled down. Each step is either `Hard` (the run stops) or
//! `WarnOnly` (the failure is logged and the run continues), and the
//! [`ResizeReport`] records how far the run got.

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::validation::{parse_quantity_nanos, validate_pvc_resize};
use crate::crd::{Pgcluster, Pgreplica};
use crate::resources::cluster_ops::ClusterOps;
use crate::resources::instance::{scale_deployment, stop_postgresql_instance};
use crate::resources::labels;

const STORAGE_RESOURCE: &str = "storage";

/// One step of a replica PVC resize, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResizeStep {
    /// Consume the do-not-resize annotation left by a cluster-driven resize
    CheckAnnotation,
    Validate,
    /// Find the Deployment and its PVC
    Lookup,
    ResizeClaim,
    StopInstance,
    ScaleDown,
    ScaleUp,
}

/// How a step failure affects the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Stop the run
    Hard,
    /// Log and continue with the next step
    WarnOnly,
}

impl ResizeStep {
    pub const SEQUENCE: [ResizeStep; 7] = [
        ResizeStep::CheckAnnotation,
        ResizeStep::Validate,
        ResizeStep::Lookup,
        ResizeStep::ResizeClaim,
        ResizeStep::StopInstance,
        ResizeStep::ScaleDown,
        ResizeStep::ScaleUp,
    ];

    pub fn kind(self) -> StepKind {
        match self {
            ResizeStep::StopInstance | ResizeStep::ScaleUp => StepKind::WarnOnly,
            _ => StepKind::Hard,
        }
    }
}

impl fmt::Display for ResizeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResizeStep::CheckAnnotation => write!(f, "CheckAnnotation"),
            ResizeStep::Validate => write!(f, "Validate"),
            ResizeStep::Lookup => write!(f, "Lookup"),
            ResizeStep::ResizeClaim => write!(f, "ResizeClaim"),
            ResizeStep::StopInstance => write!(f, "StopInstance"),
            ResizeStep::ScaleDown => write!(f, "ScaleDown"),
            ResizeStep::ScaleUp => write!(f, "ScaleUp"),
        }
    }
}

/// Where a resize ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeState {
    SizeUnchanged,
    /// Size changed but the new size was not accepted (yet)
    Requested,
    BlockedByAnnotation,
    Validated,
    /// The PVC carries the new size
    Applied,
}

impl fmt::Display for ResizeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResizeState::SizeUnchanged => write!(f, "size-unchanged"),
            ResizeState::Requested => write!(f, "resize-requested"),
            ResizeState::BlockedByAnnotation => write!(f, "resize-blocked-by-annotation"),
            ResizeState::Validated => write!(f, "resize-validated"),
            ResizeState::Applied => write!(f, "resize-applied"),
        }
    }
}

/// Outcome of a resize run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeReport {
    pub state: ResizeState,
    pub last_completed: Option<ResizeStep>,
    /// Hard step that stopped the run
    pub failed_step: Option<ResizeStep>,
    pub error: Option<String>,
    /// Failed warn-only steps with their errors
    pub warnings: Vec<(ResizeStep, String)>,
}

impl ResizeReport {
    fn new(state: ResizeState) -> Self {
        Self {
            state,
            last_completed: None,
            failed_step: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    /// Whether the run reached its end without a hard failure
    pub fn is_complete(&self) -> bool {
        self.failed_step.is_none() && self.last_completed == Some(ResizeStep::ScaleUp)
    }
}

enum StepOutcome {
    Continue(Option<ResizeState>),
    Stop(ResizeState),
}

/// Mutable state threaded through the steps of one run
struct ResizeRun<'a> {
    ops: &'a dyn ClusterOps,
    namespace: String,
    old: &'a Pgreplica,
    new: &'a Pgreplica,
    deployment: Option<Deployment>,
    pvc: Option<PersistentVolumeClaim>,
}

impl ResizeRun<'_> {
    fn deployment_name(&self) -> Result<String> {
        self.deployment
            .as_ref()
            .map(|d| d.name_any())
            .ok_or(Error::MissingObjectKey(".metadata.name"))
    }

    async fn execute(&mut self, step: ResizeStep) -> Result<StepOutcome> {
        match step {
            ResizeStep::CheckAnnotation => {
                if !self.new.annotations().contains_key(labels::ANNOTATION_DO_NOT_RESIZE) {
                    return Ok(StepOutcome::Continue(None));
                }
                let mut replica = self.new.clone();
                replica
                    .annotations_mut()
                    .remove(labels::ANNOTATION_DO_NOT_RESIZE);
                self.ops.replace_replica(&replica).await?;
                info!(
                    replica = %self.new.name_any(),
                    "size set by cluster resize, cleared do-not-resize annotation"
                );
                Ok(StepOutcome::Stop(ResizeState::BlockedByAnnotation))
            }
            ResizeStep::Validate => {
                validate_pvc_resize(
                    &self.old.spec.replica_storage.size,
                    &self.new.spec.replica_storage.size,
                )?;
                Ok(StepOutcome::Continue(Some(ResizeState::Validated)))
            }
            ResizeStep::Lookup => {
                let name = &self.new.spec.name;
                let deployment = self
                    .ops
                    .get_deployment(&self.namespace, name)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("deployment {}/{}", self.namespace, name))
                    })?;
                let pvc_name = deployment.name_any();
                let pvc = self
                    .ops
                    .get_pvc(&self.namespace, &pvc_name)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("pvc {}/{}", self.namespace, pvc_name)))?;
                self.deployment = Some(deployment);
                self.pvc = Some(pvc);
                Ok(StepOutcome::Continue(None))
            }
            ResizeStep::ResizeClaim => {
                let mut pvc = self
                    .pvc
                    .take()
                    .ok_or(Error::MissingObjectKey(".spec.resources"))?;
                set_storage_request(&mut pvc, &self.new.spec.replica_storage.size);
                self.ops.replace_pvc(&self.namespace, &pvc).await?;
                info!(
                    pvc = %pvc.name_any(),
                    size = %self.new.spec.replica_storage.size,
                    "updated pvc size"
                );
                self.pvc = Some(pvc);
                Ok(StepOutcome::Continue(Some(ResizeState::Applied)))
            }
            ResizeStep::StopInstance => {
                let name = self.deployment_name()?;
                stop_postgresql_instance(self.ops, &self.namespace, &name).await?;
                Ok(StepOutcome::Continue(None))
            }
            ResizeStep::ScaleDown => {
                let name = self.deployment_name()?;
                scale_deployment(self.ops, &self.namespace, &name, 0).await?;
                Ok(StepOutcome::Continue(None))
            }
            ResizeStep::ScaleUp => {
                let name = self.deployment_name()?;
                scale_deployment(self.ops, &self.namespace, &name, 1).await?;
                Ok(StepOutcome::Continue(None))
            }
        }
    }
}

/// Set `spec.resources.requests.storage` of a claim
pub fn set_storage_request(pvc: &mut PersistentVolumeClaim, size: &str) {
    pvc.spec
        .get_or_insert_default()
        .resources
        .get_or_insert_default()
        .requests
        .get_or_insert_default()
        .insert(STORAGE_RESOURCE.to_string(), Quantity(size.to_string()));
}

/// Resize the PVC of a replica after its storage size changed
pub async fn resize_replica_pvc(
    ops: &dyn ClusterOps,
    old: &Pgreplica,
    new: &Pgreplica,
) -> ResizeReport {
    if old.spec.replica_storage.size == new.spec.replica_storage.size {
        return ResizeReport::new(ResizeState::SizeUnchanged);
    }

    let mut report = ResizeReport::new(ResizeState::Requested);
    let Some(namespace) = new.namespace() else {
        report.error = Some(Error::MissingObjectKey(".metadata.namespace").to_string());
        return report;
    };

    debug!(
        replica = %new.name_any(),
        old_size = %old.spec.replica_storage.size,
        new_size = %new.spec.replica_storage.size,
        "pvc resize requested"
    );

    let mut run = ResizeRun {
        ops,
        namespace,
        old,
        new,
        deployment: None,
        pvc: None,
    };

    for step in ResizeStep::SEQUENCE {
        match run.execute(step).await {
            Ok(StepOutcome::Continue(state)) => {
                report.last_completed = Some(step);
                if let Some(state) = state {
                    report.state = state;
                }
            }
            Ok(StepOutcome::Stop(state)) => {
                report.last_completed = Some(step);
                report.state = state;
                return report;
            }
            Err(e) => match step.kind() {
                StepKind::Hard => {
                    error!(replica = %new.name_any(), %step, error = %e, "pvc resize aborted");
                    report.failed_step = Some(step);
                    report.error = Some(e.to_string());
                    return report;
                }
                StepKind::WarnOnly => {
                    warn!(replica = %new.name_any(), %step, error = %e, "pvc resize step failed, continuing");
                    report.warnings.push((step, e.to_string()));
                }
            },
        }
    }

    info!(replica = %new.name_any(), state = %report.state, "pvc resize finished");
    report
}

/// Resize the PVC of one cluster instance to the cluster's primary storage size
///
/// An instance backed by a Pgreplica that is smaller than the cluster size
/// (or has an unreadable size) is first moved to the cluster size and marked
/// with the do-not-resize annotation, so the replica handler does not resize
/// it a second time. Replicas already larger than the cluster are left alone.
pub async fn apply_cluster_resize(
    ops: &dyn ClusterOps,
    cluster: &Pgcluster,
    deployment: &Deployment,
) -> Result<()> {
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = deployment.name_any();
    let cluster_size = &cluster.spec.primary_storage.size;
    let cluster_nanos = parse_quantity_nanos(cluster_size)?;
    debug!(deployment = %name, size = %cluster_size, "resize cluster pvc");

    match ops.get_replica(&namespace, &name).await {
        Ok(mut instance) => {
            match parse_quantity_nanos(&instance.spec.replica_storage.size) {
                Ok(instance_nanos) if instance_nanos >= cluster_nanos => {
                    info!(
                        instance = %name,
                        "skipping pvc resize, instance size is not smaller than the cluster size"
                    );
                    return Ok(());
                }
                _ => {}
            }

            instance.annotations_mut().insert(
                labels::ANNOTATION_DO_NOT_RESIZE.to_string(),
                labels::TRUE.to_string(),
            );
            instance.spec.replica_storage.size = cluster_size.clone();
            if let Err(e) = ops.replace_replica(&instance).await {
                error!(instance = %name, error = %e, "could not resize instance");
                return Ok(());
            }
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let mut pvc = ops
        .get_pvc(&namespace, &name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("pvc {}/{}", namespace, name)))?;
    set_storage_request(&mut pvc, cluster_size);
    ops.replace_pvc(&namespace, &pvc).await?;

    info!(pvc = %name, size = %cluster_size, "resized cluster pvc");
    Ok(())
}
