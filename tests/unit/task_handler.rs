//! Unit tests for the Pgtask handler

use postgres_operator::controller::{ResourceEventHandler, TaskHandler};
use postgres_operator::crd::{PgtaskStatus, TaskState, TaskType};
use postgres_operator::resources::ExecOutput;
use postgres_operator::resources::labels;

use crate::common::*;

fn handler() -> (std::sync::Arc<FakeClusterOps>, TaskHandler) {
    let (ops, ctx) = fake_context();
    (ops, TaskHandler::new(ctx))
}

#[tokio::test]
async fn test_failover_task_completes() {
    let (ops, handler) = handler();
    ops.add_pod(pod(
        "hippo-abc-123",
        "hippo-abc",
        "Running",
        labels::ROLE_REPLICA,
        "node-2",
    ));
    let t = task(
        "hippo-failover",
        TaskType::Failover,
        &[(labels::PG_CLUSTER, CLUSTER), (labels::TARGET, "hippo-abc")],
    );

    handler.handle_task(&t).await.unwrap();

    let status = ops.task_status(NAMESPACE, "hippo-failover").unwrap();
    assert_eq!(status.state, Some(TaskState::Completed));
    assert_eq!(ops.exec_calls()[0].command[5], "hippo-abc-123");
}

#[tokio::test]
async fn test_failed_failover_marks_task_processed() {
    let (ops, handler) = handler();
    let t = task(
        "hippo-failover",
        TaskType::Failover,
        &[(labels::PG_CLUSTER, CLUSTER), (labels::TARGET, "hippo-abc")],
    );

    assert!(handler.handle_task(&t).await.is_err());

    let status = ops.task_status(NAMESPACE, "hippo-failover").unwrap();
    assert_eq!(status.state, Some(TaskState::Processed));
    assert!(status.message.contains("hippo-abc"));
}

#[tokio::test]
async fn test_failover_task_with_failed_exit_is_not_completed() {
    let (ops, handler) = handler();
    ops.add_pod(pod(
        "hippo-abc-123",
        "hippo-abc",
        "Running",
        labels::ROLE_REPLICA,
        "node-2",
    ));
    ops.push_exec_output(ExecOutput::failed("", "", "exit status 1"));
    let t = task(
        "hippo-failover",
        TaskType::Failover,
        &[(labels::PG_CLUSTER, CLUSTER), (labels::TARGET, "hippo-abc")],
    );

    assert!(handler.handle_task(&t).await.is_err());

    let status = ops.task_status(NAMESPACE, "hippo-failover").unwrap();
    assert_eq!(status.state, Some(TaskState::Processed));
}

#[tokio::test]
async fn test_failover_task_without_cluster_label() {
    let (ops, handler) = handler();
    let t = task("hippo-failover", TaskType::Failover, &[]);

    assert!(handler.handle_task(&t).await.is_err());
    assert!(ops.exec_calls().is_empty());
    assert_eq!(
        ops.task_status(NAMESPACE, "hippo-failover").unwrap().state,
        Some(TaskState::Processed)
    );
}

#[tokio::test]
async fn test_autofailover_task_pauses_patroni() {
    let (ops, handler) = handler();
    ops.add_cluster(cluster(CLUSTER, true));
    ops.add_config_map(patroni_config_map(CLUSTER, r#"{"ttl":30}"#));
    let mut t = task(
        "hippo-autofail",
        TaskType::AutoFailover,
        &[(labels::PG_CLUSTER, CLUSTER)],
    );
    t.spec
        .parameters
        .insert("autofail".to_string(), "false".to_string());

    handler.handle_task(&t).await.unwrap();

    let cm = ops.config_map(NAMESPACE, "hippo-config").unwrap();
    let config: serde_json::Value = serde_json::from_str(
        &cm.metadata.annotations.unwrap()[labels::ANNOTATION_PATRONI_CONFIG],
    )
    .unwrap();
    assert_eq!(config["pause"], true);
    assert_eq!(
        ops.task_status(NAMESPACE, "hippo-autofail").unwrap().state,
        Some(TaskState::Completed)
    );
}

#[tokio::test]
async fn test_other_task_types_are_ignored() {
    let (ops, handler) = handler();
    let t = task("hippo-backup", TaskType::Backup, &[(labels::PG_CLUSTER, CLUSTER)]);

    handler.handle_task(&t).await.unwrap();

    assert!(ops.calls().is_empty());
}

#[tokio::test]
async fn test_on_add_skips_finished_task() {
    let (ops, handler) = handler();
    let mut t = task(
        "hippo-failover",
        TaskType::Failover,
        &[(labels::PG_CLUSTER, CLUSTER)],
    );
    t.status = Some(PgtaskStatus::completed("done"));

    handler.on_add(&t).await;

    assert!(ops.calls().is_empty());
}
