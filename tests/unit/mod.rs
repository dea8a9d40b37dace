//! Unit tests for the PostgreSQL Operator
//!
//! Controller logic runs against the in-memory `FakeClusterOps`. Covered:
//! - Replica queue processing, provisioning and delete protection
//! - Replica service and toleration updates
//! - PVC resize sequencing for replicas and clusters
//! - Failover, switchover and automated failover toggling
//! - Replication status collection
//! - Storage provisioning
//! - Pgtask and Pgcluster handlers

#[path = "../common/mod.rs"]
mod common;

mod failover;
mod pvc_resize;
mod replica_controller;
mod replication_status;
mod task_handler;
