pub mod cluster_handler;
pub mod context;
pub mod error;
pub mod informer;
pub mod pvc_resize;
pub mod queue;
pub mod replica_controller;
pub mod replication_status;
pub mod task_handler;
pub mod validation;

pub use cluster_handler::{ClusterHandler, InstanceUpdate, cluster_tolerations_for};
pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use informer::{Informer, ResourceEventHandler, object_key, split_key};
pub use pvc_resize::{
    ResizeReport, ResizeState, ResizeStep, StepKind, apply_cluster_resize, resize_replica_pvc,
};
pub use queue::WorkQueue;
pub use replica_controller::ReplicaController;
pub use replication_status::{InstanceReplicationInfo, ReplicationStatusCollector};
pub use task_handler::TaskHandler;
pub use validation::{parse_quantity_nanos, validate_pvc_resize};
