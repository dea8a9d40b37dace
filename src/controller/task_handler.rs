//! Handler for Pgtask resources carrying failover work
//!
//! Only `failover` and `autofailover` tasks are acted on; other task types
//! belong to other controllers and are ignored. A task is handled once: its
//! status moves to Completed on success and Processed on failure.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, trace};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::informer::ResourceEventHandler;
use crate::crd::{Pgtask, PgtaskStatus, TaskType};
use crate::resources::failover::{FailoverRequest, failover, toggle_autofailover};
use crate::resources::labels;

/// Task parameter selecting whether automated failover is enabled
pub const AUTOFAIL_PARAMETER: &str = "autofail";

/// Read the requested automated failover setting of an autofailover task
pub fn autofail_setting(task: &Pgtask) -> Result<bool> {
    match task.spec.parameters.get(AUTOFAIL_PARAMETER).map(String::as_str) {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        other => Err(Error::ValidationError(format!(
            "autofailover task {} needs parameter {}=true|false, got {:?}",
            task.name_any(),
            AUTOFAIL_PARAMETER,
            other
        ))),
    }
}

pub struct TaskHandler {
    ctx: Arc<Context>,
}

impl TaskHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Run a failover task; the outcome is recorded as a metric either way
    async fn run_failover(&self, task: &Pgtask) -> Result<String> {
        let request = FailoverRequest::from_task(task)?;
        let result = failover(
            self.ctx.ops.as_ref(),
            &request.namespace,
            &request.cluster_name,
            &request.target,
        )
        .await;
        self.ctx
            .record_failover(&request.namespace, &request.cluster_name, result.is_ok());
        result?;
        Ok(format!("failover of cluster {} completed", request.cluster_name))
    }

    async fn run_autofailover(&self, task: &Pgtask) -> Result<String> {
        let enable = autofail_setting(task)?;
        let namespace = task
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let cluster_name = task
            .labels()
            .get(labels::PG_CLUSTER)
            .cloned()
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "autofailover task {} has no {} label",
                    task.name_any(),
                    labels::PG_CLUSTER
                ))
            })?;

        let cluster = self.ctx.ops.get_cluster(&namespace, &cluster_name).await?;
        toggle_autofailover(self.ctx.ops.as_ref(), &cluster, enable).await?;
        Ok(format!(
            "automated failover {} for cluster {}",
            if enable { "enabled" } else { "disabled" },
            cluster_name
        ))
    }

    /// Carry out a task and record the outcome in its status
    #[instrument(skip_all, fields(task = %task.name_any()))]
    pub async fn handle_task(&self, task: &Pgtask) -> Result<()> {
        let result = match task.spec.task_type {
            TaskType::Failover => self.run_failover(task).await,
            TaskType::AutoFailover => self.run_autofailover(task).await,
            other => {
                trace!(task_type = ?other, "not a failover task");
                return Ok(());
            }
        };

        let status = match &result {
            Ok(message) => {
                info!(%message, "task completed");
                PgtaskStatus::completed(message.clone())
            }
            Err(e) => {
                error!(error = %e, "task failed");
                self.ctx.record_handler_error("task");
                PgtaskStatus::processed(e.to_string())
            }
        };

        let namespace = task
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        self.ctx
            .ops
            .patch_task_status(&namespace, &task.name_any(), &status)
            .await?;
        result.map(|_| ())
    }
}

#[async_trait]
impl ResourceEventHandler<Pgtask> for TaskHandler {
    async fn on_add(&self, task: &Pgtask) {
        if task.is_finished() {
            debug!(task = %task.name_any(), "task already handled");
            return;
        }
        // Failures are already logged and recorded on the task
        let _ = self.handle_task(task).await;
    }

    async fn on_update(&self, _old: &Pgtask, _new: &Pgtask) {}

    async fn on_delete(&self, task: &Pgtask) {
        trace!(task = %task.name_any(), "task deleted");
    }
}
