//! Unit tests for replication status collection

use postgres_operator::controller::ReplicationStatusCollector;
use postgres_operator::controller::replication_status::UNAVAILABLE;
use postgres_operator::resources::ExecOutput;
use postgres_operator::resources::labels;

use crate::common::*;

const MEMBERS: &str = r#"[
    {"Cluster": "hippo", "Member": "hippo-7f9c-0", "Host": "10.0.0.1", "Role": "Leader", "State": "running", "TL": 5},
    {"Cluster": "hippo", "Member": "hippo-abc-123", "Host": "10.0.0.2", "Role": "Replica", "State": "running", "TL": 5, "Lag in MB": 2, "Pending restart": "*"},
    {"Cluster": "hippo", "Member": "hippo-def-456", "Host": "10.0.0.3", "Role": "Replica", "State": "", "TL": "", "Lag in MB": "unknown"}
]"#;

fn with_pods(ops: &FakeClusterOps, replica_phase: &str) {
    ops.add_pod(pod("hippo-7f9c-0", CLUSTER, "Running", labels::ROLE_PRIMARY, "node-1"));
    ops.add_pod(pod(
        "hippo-abc-123",
        "hippo-abc",
        replica_phase,
        labels::ROLE_REPLICA,
        "node-2",
    ));
}

#[tokio::test]
async fn test_replicas_only() {
    let (ops, _ctx) = fake_context();
    with_pods(&ops, "Running");
    ops.push_exec_output(ExecOutput::new(MEMBERS, ""));

    let infos = ReplicationStatusCollector::new(&*ops, NAMESPACE, CLUSTER)
        .collect(false, false)
        .await
        .unwrap();

    assert_eq!(infos.len(), 1);
    let info = &infos[0];
    assert_eq!(info.name, "hippo-abc");
    assert_eq!(info.node, "node-2");
    assert_eq!(info.pod_name, "hippo-abc-123");
    assert_eq!(info.role, "replica");
    assert_eq!(info.status, "running");
    assert_eq!(info.replication_lag, 2);
    assert_eq!(info.timeline, 5);
    assert!(info.pending_restart);

    let exec = ops.exec_calls();
    assert_eq!(exec[0].pod, "hippo-abc-123");
    assert_eq!(exec[0].container.as_deref(), Some(labels::DATABASE_CONTAINER));
    assert_eq!(exec[0].command, vec!["patronictl", "list", "-f", "json"]);
}

#[tokio::test]
async fn test_with_primary_and_busted_members() {
    let (ops, _ctx) = fake_context();
    with_pods(&ops, "Running");
    ops.push_exec_output(ExecOutput::new(MEMBERS, ""));

    let infos = ReplicationStatusCollector::new(&*ops, NAMESPACE, CLUSTER)
        .collect(true, true)
        .await
        .unwrap();

    assert_eq!(infos.len(), 3);
    assert_eq!(infos[0].role, "primary");
    assert_eq!(infos[0].name, CLUSTER);
    assert_eq!(infos[0].replication_lag, 0);

    let busted = &infos[2];
    assert_eq!(busted.pod_name, "hippo-def-456");
    assert_eq!(busted.status, "unavailable");
    assert_eq!(busted.replication_lag, UNAVAILABLE);
    assert_eq!(busted.timeline, UNAVAILABLE);
    // No pod is known for the member
    assert_eq!(busted.name, "");
}

#[tokio::test]
async fn test_no_running_pod_reports_unavailable() {
    let (ops, _ctx) = fake_context();
    with_pods(&ops, "Pending");

    let infos = ReplicationStatusCollector::new(&*ops, NAMESPACE, CLUSTER)
        .collect(false, false)
        .await
        .unwrap();

    assert!(ops.exec_calls().is_empty());
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].name, "hippo-abc");
    assert_eq!(infos[0].node, "node-2");
    assert_eq!(infos[0].status, "unavailable");
    assert_eq!(infos[0].role, "unknown");
    assert_eq!(infos[0].replication_lag, UNAVAILABLE);
    assert_eq!(infos[0].timeline, UNAVAILABLE);
    assert_eq!(infos[0].pod_name, "");
}

#[tokio::test]
async fn test_no_pods_reports_nothing() {
    let (ops, _ctx) = fake_context();

    let infos = ReplicationStatusCollector::new(&*ops, NAMESPACE, CLUSTER)
        .collect(true, true)
        .await
        .unwrap();

    assert!(infos.is_empty());
    assert!(ops.exec_calls().is_empty());
}

#[tokio::test]
async fn test_unparseable_output_reports_nothing() {
    let (ops, _ctx) = fake_context();
    with_pods(&ops, "Running");
    ops.push_exec_output(ExecOutput::new("patronictl: command not found", "oops"));

    let infos = ReplicationStatusCollector::new(&*ops, NAMESPACE, CLUSTER)
        .collect(true, false)
        .await
        .unwrap();

    assert!(infos.is_empty());
}

#[tokio::test]
async fn test_exec_failure_propagates() {
    let (ops, _ctx) = fake_context();
    with_pods(&ops, "Running");
    ops.fail_on("exec");

    assert!(
        ReplicationStatusCollector::new(&*ops, NAMESPACE, CLUSTER)
            .collect(true, false)
            .await
            .is_err()
    );
}

#[test]
fn test_records_serialize_camel_case() {
    let info = postgres_operator::controller::InstanceReplicationInfo {
        name: "hippo-abc".to_string(),
        replication_lag: 3,
        pending_restart: true,
        pod_name: "hippo-abc-123".to_string(),
        ..Default::default()
    };
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["replicationLag"], 3);
    assert_eq!(json["pendingRestart"], true);
    assert_eq!(json["podName"], "hippo-abc-123");
}
