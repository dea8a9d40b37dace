//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (has this replica acquired leadership?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels for per-object metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ObjectLabels {
    pub namespace: String,
    pub name: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ObjectLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for handler error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct HandlerLabels {
    pub handler: String,
}

impl prometheus_client::encoding::EncodeLabelSet for HandlerLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("handler", self.handler.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for failover metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FailoverLabels {
    pub namespace: String,
    pub cluster: String,
    pub outcome: String,
}

impl prometheus_client::encoding::EncodeLabelSet for FailoverLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("cluster", self.cluster.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Work queue items processed by the replica workers
    pub items_processed_total: Family<ObjectLabels, Counter>,
    /// Time spent processing one work queue item
    pub item_duration_seconds: Family<ObjectLabels, Histogram>,
    /// Errors raised by event handlers and workers
    pub handler_errors_total: Family<HandlerLabels, Counter>,
    /// Failovers issued through Patroni
    pub failovers_total: Family<FailoverLabels, Counter>,
    /// Keys waiting in the replica work queue
    pub queue_depth: Gauge,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let items_processed_total = Family::<ObjectLabels, Counter>::default();
        registry.register(
            "postgres_operator_replica_items_processed",
            "Total number of replica work queue items processed",
            items_processed_total.clone(),
        );

        let item_duration_seconds = Family::<ObjectLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 15))
        });
        registry.register(
            "postgres_operator_replica_item_duration_seconds",
            "Duration of replica work queue item processing in seconds",
            item_duration_seconds.clone(),
        );

        let handler_errors_total = Family::<HandlerLabels, Counter>::default();
        registry.register(
            "postgres_operator_handler_errors",
            "Total number of errors raised by event handlers",
            handler_errors_total.clone(),
        );

        let failovers_total = Family::<FailoverLabels, Counter>::default();
        registry.register(
            "postgres_operator_failovers",
            "Total number of failovers issued",
            failovers_total.clone(),
        );

        let queue_depth = Gauge::default();
        registry.register(
            "postgres_operator_replica_queue_depth",
            "Number of keys waiting in the replica work queue",
            queue_depth.clone(),
        );

        Self {
            items_processed_total,
            item_duration_seconds,
            handler_errors_total,
            failovers_total,
            queue_depth,
            registry,
        }
    }

    /// Record a processed work queue item
    pub fn record_processed(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ObjectLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.items_processed_total.get_or_create(&labels).inc();
        self.item_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record an error from the named handler
    pub fn record_handler_error(&self, handler: &str) {
        let labels = HandlerLabels {
            handler: handler.to_string(),
        };
        self.handler_errors_total.get_or_create(&labels).inc();
    }

    /// Record a failover attempt
    pub fn record_failover(&self, namespace: &str, cluster: &str, success: bool) {
        let labels = FailoverLabels {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            outcome: if success { "success" } else { "failure" }.to_string(),
        };
        self.failovers_total.get_or_create(&labels).inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (leading and running controllers)
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Unix timestamp of the last processed work item
    pub last_processed: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_processed: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Remember when a work item was last processed
    pub fn touch(&self) {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        self.last_processed.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
///
/// Returns Prometheus-formatted metrics.
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server on the given address
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Health server listening on {}", addr);

    axum::serve(listener, app).await
}
