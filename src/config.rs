//! Operator configuration
//!
//! Parsed once from flags and environment variables in `main` and handed to
//! every component behind an `Arc`.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::crd::{PodAntiAffinityType, ServiceType};
use crate::resources::instance::ReadinessWait;

/// Default log directives; `CRUNCHY_DEBUG` raises the operator to debug
const DEFAULT_LOG_FILTER: &str = "postgres_operator=info,kube=warn";
const DEBUG_LOG_FILTER: &str = "postgres_operator=debug,kube=info";

#[derive(Parser, Debug, Clone)]
#[command(name = "postgres-operator", version, about = "PostgreSQL operator", long_about = None)]
pub struct OperatorConfig {
    /// Print the CRD manifests to stdout and exit
    #[arg(long = "print-crds")]
    pub print_crds: bool,

    /// Namespace to watch; all namespaces when empty
    #[arg(long, env = "NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Name of this pod, used as the leader election identity
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,

    /// Number of workers processing the replica queue
    #[arg(long, env = "REPLICA_WORKERS", default_value_t = 1)]
    pub replica_workers: usize,

    /// Service type for replica services when neither the replica nor the cluster sets one
    #[arg(long, env = "DEFAULT_SERVICE_TYPE", default_value = "ClusterIP", value_parser = parse_service_type)]
    pub default_service_type: ServiceType,

    /// Pod anti-affinity for instances of clusters that do not set one
    #[arg(long, env = "DEFAULT_POD_ANTI_AFFINITY", default_value = "preferred", value_parser = parse_anti_affinity)]
    pub default_pod_anti_affinity: PodAntiAffinityType,

    /// Address of the health and metrics server
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    pub health_addr: SocketAddr,

    /// Requeue retryable failures with backoff instead of dropping them
    #[arg(long, env = "REQUEUE_ON_ERROR", default_value_t = false)]
    pub requeue_on_error: bool,

    /// Seconds between readiness checks of an instance during a rolling update
    #[arg(long, env = "ROLLING_UPDATE_PERIOD", default_value = "4", value_parser = parse_seconds)]
    pub rolling_update_period: Duration,

    /// Seconds to wait for an instance to come back before moving on
    #[arg(long, env = "ROLLING_UPDATE_TIMEOUT", default_value = "60", value_parser = parse_seconds)]
    pub rolling_update_timeout: Duration,

    /// Enable debug logging for the operator
    #[arg(long, env = "CRUNCHY_DEBUG", default_value_t = false)]
    pub debug: bool,
}

fn parse_service_type(value: &str) -> Result<ServiceType, String> {
    value.parse().map_err(|e: crate::crd::FieldError| e.to_string())
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("invalid number of seconds {:?}: {}", value, e))
}

fn parse_anti_affinity(value: &str) -> Result<PodAntiAffinityType, String> {
    value
        .parse()
        .map_err(|e: crate::crd::FieldError| e.to_string())
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            print_crds: false,
            namespace: String::new(),
            pod_name: None,
            pod_namespace: "default".to_string(),
            replica_workers: 1,
            default_service_type: ServiceType::ClusterIP,
            default_pod_anti_affinity: PodAntiAffinityType::Preferred,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            requeue_on_error: false,
            rolling_update_period: Duration::from_secs(4),
            rolling_update_timeout: Duration::from_secs(60),
            debug: false,
        }
    }
}

impl OperatorConfig {
    /// Namespace to watch, or `None` for all namespaces
    pub fn watch_namespace(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }

    /// Tracing filter directives; `RUST_LOG` takes precedence when set
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            DEBUG_LOG_FILTER
        } else {
            DEFAULT_LOG_FILTER
        }
    }

    /// Readiness polling used between instances of a rolling update
    pub fn rolling_update_wait(&self) -> ReadinessWait {
        ReadinessWait {
            period: self.rolling_update_period,
            timeout: self.rolling_update_timeout,
        }
    }

    /// At least one worker always runs
    pub fn worker_count(&self) -> usize {
        self.replica_workers.max(1)
    }
}
