//! Pgcluster changes that fan out to every instance of the cluster
//!
//! A new primary storage size is pushed to the PVC of each instance, and new
//! cluster tolerations to each instance Deployment that does not carry its
//! own. Instances are updated replicas first, and each updated replica is
//! given time to come back and accept connections. When there is a single
//! primary a switchover then moves it onto an updated replica before the old
//! primary is touched. Failures on one instance are logged and the update
//! moves on; a replica that does not come back in time is only warned about.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::informer::ResourceEventHandler;
use crate::controller::pvc_resize::apply_cluster_resize;
use crate::controller::validation::validate_pvc_resize;
use crate::crd::{Pgcluster, Toleration, to_k8s_tolerations};
use crate::resources::cluster_ops::ClusterOps;
use crate::resources::failover::switchover;
use crate::resources::instance::{
    restart_instance, stop_postgresql_instance, wait_for_instance_ready,
};
use crate::resources::labels;
use crate::resources::replica::cluster_port;

/// Change applied to each instance during a rolling update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceUpdate {
    /// Grow the data PVC to the cluster size; the instance is scaled to zero
    /// while the claim is released
    Resize,
    Tolerations,
}

/// Tolerations the cluster imposes on one of its instance Deployments
///
/// The primary Deployment (named after the cluster) always takes the cluster
/// tolerations. A replica takes them only when it has none of its own, since
/// its own tolerations are managed by the replica controller; `None` means the
/// Deployment is left alone.
pub async fn cluster_tolerations_for(
    ops: &dyn ClusterOps,
    cluster: &Pgcluster,
    deployment_name: &str,
) -> Result<Option<Vec<Toleration>>> {
    if deployment_name == cluster.name_any() {
        return Ok(Some(cluster.spec.tolerations.clone()));
    }

    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let instance = ops.get_replica(&namespace, deployment_name).await?;
    if !instance.spec.tolerations.is_empty() {
        return Ok(None);
    }
    Ok(Some(cluster.spec.tolerations.clone()))
}

/// Instance Deployments of a cluster split into (primaries, replicas)
///
/// The role label lives on the pods, so a Deployment counts as a primary when
/// one of its pods is labelled `role=master`. This is a snapshot; the roles can
/// change while an update runs.
pub async fn instances_by_role(
    ops: &dyn ClusterOps,
    cluster: &Pgcluster,
) -> Result<(Vec<Deployment>, Vec<Deployment>)> {
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let selector = labels::database_selector(&cluster.name_any());

    let primaries: HashSet<String> = ops
        .list_pods(&namespace, &selector, None)
        .await?
        .iter()
        .filter(|pod| {
            pod.labels().get(labels::ROLE).map(String::as_str) == Some(labels::ROLE_PRIMARY)
        })
        .filter_map(|pod| pod.labels().get(labels::DEPLOYMENT_NAME).cloned())
        .collect();

    Ok(ops
        .list_deployments(&namespace, &selector)
        .await?
        .into_iter()
        .partition(|d| primaries.contains(&d.name_any())))
}

/// Handler for Pgcluster events
pub struct ClusterHandler {
    ctx: Arc<Context>,
}

impl ClusterHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn update_instance(
        &self,
        cluster: &Pgcluster,
        mut deployment: Deployment,
        update: InstanceUpdate,
    ) -> Result<()> {
        let ops = self.ctx.ops.as_ref();
        let namespace = cluster
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = deployment.name_any();

        match update {
            InstanceUpdate::Resize => {
                apply_cluster_resize(ops, cluster, &deployment).await?;
                restart_instance(ops, &namespace, &name).await?;
            }
            InstanceUpdate::Tolerations => {
                let Some(tolerations) = cluster_tolerations_for(ops, cluster, &name).await? else {
                    debug!(deployment = %name, "instance has its own tolerations");
                    return Ok(());
                };
                if let Some(pod_spec) = deployment
                    .spec
                    .as_mut()
                    .and_then(|s| s.template.spec.as_mut())
                {
                    pod_spec.tolerations = Some(to_k8s_tolerations(&tolerations));
                }
                if let Err(e) = stop_postgresql_instance(ops, &namespace, &name).await {
                    warn!(deployment = %name, error = %e, "could not stop PostgreSQL");
                }
                ops.replace_deployment(&namespace, &deployment).await?;
            }
        }

        info!(deployment = %name, ?update, "updated instance");
        Ok(())
    }

    /// Apply an update to every instance, replicas before the primary
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name_any()))]
    pub async fn rolling_update(&self, cluster: &Pgcluster, update: InstanceUpdate) -> Result<()> {
        let namespace = cluster
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let (primaries, replicas) = instances_by_role(self.ctx.ops.as_ref(), cluster).await?;
        debug!(
            primaries = primaries.len(),
            replicas = replicas.len(),
            "rolling update started"
        );

        let switch = !replicas.is_empty() && primaries.len() == 1;
        let port = cluster_port(cluster)?;
        let wait = self.ctx.config.rolling_update_wait();

        for deployment in replicas {
            let name = deployment.name_any();
            if let Err(e) = self.update_instance(cluster, deployment, update).await {
                error!(deployment = %name, error = %e, "could not update instance");
                continue;
            }
            if let Err(e) =
                wait_for_instance_ready(self.ctx.ops.as_ref(), &namespace, &name, port, wait).await
            {
                warn!(deployment = %name, error = %e, "instance did not come back in time");
            }
        }

        if switch {
            if let Err(e) =
                switchover(self.ctx.ops.as_ref(), &namespace, &cluster.name_any(), "").await
            {
                warn!(error = %e, "switchover failed");
            }
        }

        for deployment in primaries {
            let name = deployment.name_any();
            if let Err(e) = self.update_instance(cluster, deployment, update).await {
                error!(deployment = %name, error = %e, "could not update instance");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ResourceEventHandler<Pgcluster> for ClusterHandler {
    async fn on_add(&self, cluster: &Pgcluster) {
        trace!(cluster = %cluster.name_any(), "cluster added");
    }

    #[instrument(skip_all, fields(cluster = %new.name_any()))]
    async fn on_update(&self, old: &Pgcluster, new: &Pgcluster) {
        if old.spec.primary_storage.size != new.spec.primary_storage.size {
            let result = match validate_pvc_resize(
                &old.spec.primary_storage.size,
                &new.spec.primary_storage.size,
            ) {
                Ok(()) => self.rolling_update(new, InstanceUpdate::Resize).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(error = %e, "cluster pvc resize failed");
                self.ctx.record_handler_error("cluster_on_update");
            }
        }

        if old.spec.tolerations != new.spec.tolerations {
            if let Err(e) = self.rolling_update(new, InstanceUpdate::Tolerations).await {
                error!(error = %e, "could not apply cluster tolerations");
                self.ctx.record_handler_error("cluster_on_update");
            }
        }
    }

    async fn on_delete(&self, cluster: &Pgcluster) {
        trace!(cluster = %cluster.name_any(), "cluster deleted");
    }
}
