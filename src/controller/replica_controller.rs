//! Controller for Pgreplica resources
//!
//! New replicas are queued by `on_add` and provisioned by the workers once
//! their cluster is initialized. Updates are handled inline by `on_update`:
//! provisioning a replica whose cluster became ready, re-typing the replica
//! service, applying tolerations and resizing the data volume. `on_delete`
//! removes the replica Deployment unless the instance was promoted.
//!
//! Errors never stop a worker. By default a failed key is forgotten rather
//! than retried; `requeue_on_error` turns retryable failures into
//! rate-limited requeues instead.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::informer::{ResourceEventHandler, object_key, split_key};
use crate::controller::pvc_resize::resize_replica_pvc;
use crate::controller::queue::WorkQueue;
use crate::controller::validation::validate_replica;
use crate::crd::{COMPLETED_STATUS, Pgcluster, Pgreplica, PgreplicaStatus, to_k8s_tolerations};
use crate::resources::instance::stop_postgresql_instance;
use crate::resources::labels;
use crate::resources::replica::{
    effective_tolerations, generate_replica_deployment, generate_replica_service,
    replica_service_type,
};
use crate::resources::storage::create_missing_replica_volume;

/// Work queue plus handlers for Pgreplica resources
pub struct ReplicaController {
    ctx: Arc<Context>,
    queue: WorkQueue<String>,
}

fn replica_namespace(replica: &Pgreplica) -> Result<String> {
    replica
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))
}

/// Whether a replica Deployment now runs the primary
///
/// After a failover the promoted instance's `service-name` label points at the
/// primary service, which is named after the cluster.
pub fn is_promoted(deployment_labels: &std::collections::BTreeMap<String, String>) -> bool {
    deployment_labels.get(labels::SERVICE_NAME) == deployment_labels.get(labels::PG_CLUSTER)
}

impl ReplicaController {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            queue: WorkQueue::new(),
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Take one key off the queue and process it
    ///
    /// Returns `false` once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let start = Instant::now();

        match self.sync_replica(&key).await {
            Ok(()) => self.queue.forget(&key).await,
            Err(e) => {
                self.ctx.record_handler_error("process_next_item");
                if self.ctx.config.requeue_on_error && e.is_retryable() {
                    warn!(%key, error = %e, "processing failed, requeueing");
                    self.queue.add_rate_limited(key.clone()).await;
                } else {
                    error!(%key, error = %e, "processing failed");
                    self.queue.forget(&key).await;
                }
            }
        }

        self.queue.done(&key).await;

        if let Ok((namespace, name)) = split_key(&key) {
            self.ctx
                .record_processed(namespace, name, start.elapsed().as_secs_f64());
        }
        self.ctx.set_queue_depth(self.queue.len().await);
        true
    }

    #[instrument(skip(self))]
    async fn sync_replica(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        let ops = &self.ctx.ops;

        if ops.get_deployment(namespace, name).await?.is_some() {
            debug!(%key, "deployment already exists, nothing to do");
            return Ok(());
        }

        let replica = ops.get_replica(namespace, name).await?;
        let cluster = ops
            .get_cluster(namespace, &replica.spec.cluster_name)
            .await?;

        if cluster.is_initialized() {
            if let Err(e) = self.scale_base(&replica).await {
                if self.ctx.config.requeue_on_error {
                    return Err(e);
                }
                error!(%key, error = %e, "could not scale up replica");
            }
            ops.patch_replica_status(namespace, name, &PgreplicaStatus::processed())
                .await?;
        } else {
            debug!(%key, cluster = %cluster.name_any(), "cluster not initialized yet");
            ops.patch_replica_status(namespace, name, &PgreplicaStatus::pending_init())
                .await?;
        }

        Ok(())
    }

    /// Provision the storage, service and Deployment of a replica
    #[instrument(skip(self, replica), fields(replica = %replica.name_any()))]
    pub async fn scale_base(&self, replica: &Pgreplica) -> Result<()> {
        if replica.is_complete() {
            warn!("replica already provisioned, not scaling up");
            return Ok(());
        }
        validate_replica(replica)?;

        let ops = self.ctx.ops.as_ref();
        let namespace = replica_namespace(replica)?;
        let name = replica.name_any();
        let cluster = ops
            .get_cluster(&namespace, &replica.spec.cluster_name)
            .await?;
        let cluster_name = cluster.name_any();

        let storage = create_missing_replica_volume(
            ops,
            &namespace,
            &cluster_name,
            &replica.spec.name,
            &replica.spec.replica_storage,
        )
        .await?;

        let patch = json!({
            "spec": { "replicastorage": { "name": storage.persistent_volume_claim_name } }
        });
        if let Err(e) = ops.patch_replica(&namespace, &name, &patch).await {
            error!(error = %e, "could not record the replica claim name");
        }

        let service_name = labels::replica_service_name(&cluster_name);
        if ops.get_service(&namespace, &service_name).await?.is_none() {
            let service_type =
                replica_service_type(replica, &cluster, self.ctx.config.default_service_type);
            let service = generate_replica_service(&cluster, service_type)?;
            ops.create_service(&namespace, &service).await?;
            info!(service = %service_name, %service_type, "created replica service");
        }

        let deployment = generate_replica_deployment(
            replica,
            &cluster,
            &storage,
            self.ctx.config.default_pod_anti_affinity,
        )?;
        ops.create_deployment(&namespace, &deployment).await?;
        info!(deployment = %replica.spec.name, "created replica deployment");

        let patch = json!({ "spec": { "status": COMPLETED_STATUS } });
        if let Err(e) = ops.patch_replica(&namespace, &name, &patch).await {
            error!(error = %e, "could not mark replica complete");
        }

        Ok(())
    }

    /// Remove the Deployment of a deleted replica
    #[instrument(skip(self, replica), fields(replica = %replica.name_any()))]
    pub async fn scale_down_base(&self, replica: &Pgreplica) -> Result<()> {
        let ops = self.ctx.ops.as_ref();
        let namespace = replica_namespace(replica)?;

        match ops
            .get_cluster(&namespace, &replica.spec.cluster_name)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!("cluster is gone, nothing to scale down");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        ops.delete_deployment(&namespace, &replica.spec.name).await?;
        info!(deployment = %replica.spec.name, "deleted replica deployment");
        Ok(())
    }

    /// Bring the replica service type in line with the replica and cluster
    pub async fn update_replica_service(
        &self,
        replica: &Pgreplica,
        cluster: &Pgcluster,
    ) -> Result<()> {
        let ops = self.ctx.ops.as_ref();
        let namespace = replica_namespace(replica)?;
        let service_name = labels::replica_service_name(&cluster.name_any());
        let service_type =
            replica_service_type(replica, cluster, self.ctx.config.default_service_type);

        match ops.get_service(&namespace, &service_name).await? {
            None => {
                let service = generate_replica_service(cluster, service_type)?;
                ops.create_service(&namespace, &service).await?;
                info!(service = %service_name, %service_type, "created replica service");
            }
            Some(existing) => {
                let current = existing.spec.as_ref().and_then(|s| s.type_.as_deref());
                if current == Some(service_type.as_str()) {
                    debug!(service = %service_name, "service type unchanged");
                    return Ok(());
                }
                let patch = json!({ "spec": { "type": service_type.as_str() } });
                ops.patch_service(&namespace, &service_name, &patch).await?;
                info!(service = %service_name, %service_type, "updated replica service type");
            }
        }
        Ok(())
    }

    /// Apply the replica's tolerations to its Deployment
    ///
    /// PostgreSQL is stopped first so the instance shuts down cleanly before
    /// the pod is rescheduled; a failed stop only warns.
    pub async fn update_replica_tolerations(
        &self,
        replica: &Pgreplica,
        cluster: &Pgcluster,
    ) -> Result<()> {
        let ops = self.ctx.ops.as_ref();
        let namespace = replica_namespace(replica)?;
        let name = &replica.spec.name;

        let mut deployment = ops
            .get_deployment(&namespace, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("deployment {}/{}", namespace, name)))?;

        if let Err(e) = stop_postgresql_instance(ops, &namespace, name).await {
            warn!(deployment = %name, error = %e, "could not stop PostgreSQL before applying tolerations");
        }

        let tolerations = to_k8s_tolerations(effective_tolerations(replica, cluster));
        if let Some(pod_spec) = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        {
            pod_spec.tolerations = Some(tolerations);
        }

        ops.replace_deployment(&namespace, &deployment).await?;
        info!(deployment = %name, "applied tolerations");
        Ok(())
    }

    /// Run `workers` workers until `token` is cancelled
    ///
    /// Cancellation shuts the queue down; workers finish the item they hold.
    pub async fn run(self: Arc<Self>, workers: usize, token: CancellationToken) {
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let controller = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                debug!(worker = id, "replica worker started");
                while controller.process_next_item().await {}
                debug!(worker = id, "replica worker stopped");
            }));
        }
        info!(workers, "replica workers started");

        token.cancelled().await;
        self.queue.shut_down().await;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "replica worker panicked");
            }
        }
        info!("replica workers stopped");
    }
}

#[async_trait]
impl ResourceEventHandler<Pgreplica> for ReplicaController {
    async fn on_add(&self, replica: &Pgreplica) {
        if replica.is_processed() {
            debug!(replica = %replica.name_any(), "already processed");
            return;
        }
        let key = object_key(replica);
        debug!(%key, "queueing replica");
        self.queue.add(key).await;
        self.ctx.set_queue_depth(self.queue.len().await);
    }

    #[instrument(skip_all, fields(replica = %new.name_any()))]
    async fn on_update(&self, old: &Pgreplica, new: &Pgreplica) {
        let Some(namespace) = new.namespace() else {
            return;
        };
        let cluster = match self
            .ctx
            .ops
            .get_cluster(&namespace, &new.spec.cluster_name)
            .await
        {
            Ok(cluster) => cluster,
            Err(e) => {
                error!(error = %e, "could not get cluster");
                self.ctx.record_handler_error("on_update");
                return;
            }
        };

        if cluster.is_initialized() && !new.is_complete() {
            if let Err(e) = self.scale_base(new).await {
                error!(error = %e, "could not scale up replica");
                self.ctx.record_handler_error("on_update");
            }
            if let Err(e) = self
                .ctx
                .ops
                .patch_replica_status(&namespace, &new.name_any(), &PgreplicaStatus::processed())
                .await
            {
                error!(error = %e, "could not update replica status");
            }
        }

        if old.spec.service_type != new.spec.service_type {
            if let Err(e) = self.update_replica_service(new, &cluster).await {
                error!(error = %e, "could not update replica service");
                self.ctx.record_handler_error("on_update");
            }
        }

        if old.spec.tolerations != new.spec.tolerations {
            if let Err(e) = self.update_replica_tolerations(new, &cluster).await {
                error!(error = %e, "could not apply replica tolerations");
                self.ctx.record_handler_error("on_update");
            }
        }

        if old.spec.replica_storage.size != new.spec.replica_storage.size {
            let report = resize_replica_pvc(self.ctx.ops.as_ref(), old, new).await;
            if report.failed_step.is_some() {
                self.ctx.record_handler_error("on_update");
            }
            debug!(?report, "pvc resize report");
        }
    }

    #[instrument(skip_all, fields(replica = %replica.name_any()))]
    async fn on_delete(&self, replica: &Pgreplica) {
        let Some(namespace) = replica.namespace() else {
            return;
        };
        let deployment = match self
            .ctx
            .ops
            .get_deployment(&namespace, &replica.spec.name)
            .await
        {
            Ok(Some(deployment)) => deployment,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "could not get replica deployment");
                return;
            }
        };

        if is_promoted(deployment.labels()) {
            debug!("replica is acting as the primary, not scaling down");
            return;
        }

        if let Err(e) = self.scale_down_base(replica).await {
            error!(error = %e, "could not scale down replica");
            self.ctx.record_handler_error("on_delete");
        }
    }
}
