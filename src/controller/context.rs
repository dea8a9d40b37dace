use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::health::HealthState;
use crate::resources::cluster_ops::{ClusterOps, KubeClusterOps};

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes API access
    pub ops: Arc<dyn ClusterOps>,
    pub config: Arc<OperatorConfig>,
    /// Health state for recording metrics
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self::with_ops(Arc::new(KubeClusterOps::new(client)), config, health_state)
    }

    /// Context over any [`ClusterOps`] implementation
    pub fn with_ops(
        ops: Arc<dyn ClusterOps>,
        config: Arc<OperatorConfig>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            ops,
            config,
            health_state,
        }
    }

    /// Record a processed work queue item
    pub fn record_processed(&self, namespace: &str, name: &str, duration_secs: f64) {
        if let Some(ref state) = self.health_state {
            state
                .metrics
                .record_processed(namespace, name, duration_secs);
            state.touch();
        }
    }

    /// Record an error from the named handler
    pub fn record_handler_error(&self, handler: &str) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_handler_error(handler);
        }
    }

    pub fn record_failover(&self, namespace: &str, cluster: &str, success: bool) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_failover(namespace, cluster, success);
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(ref state) = self.health_state {
            state.metrics.set_queue_depth(depth);
        }
    }
}
