//! Unit tests for failover, switchover and automated failover toggling

use serde_json::Value;

use postgres_operator::controller::Error;
use postgres_operator::resources::ExecOutput;
use postgres_operator::resources::failover::{
    failover, remove_primary_on_role_change_tag, switchover, toggle_autofailover,
};
use postgres_operator::resources::labels;

use crate::common::*;

fn with_pods(ops: &FakeClusterOps) {
    ops.add_pod(pod("hippo-7f9c-0", CLUSTER, "Running", labels::ROLE_PRIMARY, "node-1"));
    ops.add_pod(pod(
        "hippo-abc-123",
        "hippo-abc",
        "Running",
        labels::ROLE_REPLICA,
        "node-2",
    ));
    ops.add_pod(pod(
        "hippo-def-456",
        "hippo-def",
        "Pending",
        labels::ROLE_REPLICA,
        "node-3",
    ));
}

// =============================================================================
// Failover
// =============================================================================

mod failover_tests {
    use super::*;

    #[tokio::test]
    async fn test_failover_to_candidate() {
        let (ops, _ctx) = fake_context();
        with_pods(&ops);

        failover(&*ops, NAMESPACE, CLUSTER, "hippo-abc")
            .await
            .unwrap();

        let exec = ops.exec_calls();
        assert_eq!(exec.len(), 1);
        assert_eq!(exec[0].pod, "hippo-abc-123");
        assert_eq!(exec[0].container.as_deref(), Some(labels::DATABASE_CONTAINER));
        assert_eq!(
            exec[0].command,
            vec![
                "patronictl",
                "failover",
                "--force",
                "hippo",
                "--candidate",
                "hippo-abc-123"
            ]
        );
    }

    #[tokio::test]
    async fn test_failover_without_candidate() {
        let (ops, _ctx) = fake_context();
        with_pods(&ops);

        failover(&*ops, NAMESPACE, CLUSTER, "").await.unwrap();

        let exec = ops.exec_calls();
        assert_eq!(exec.len(), 1);
        assert_eq!(
            exec[0].command,
            vec!["patronictl", "failover", "--force", "hippo"]
        );
    }

    #[tokio::test]
    async fn test_failover_candidate_not_running() {
        let (ops, _ctx) = fake_context();
        with_pods(&ops);

        let err = failover(&*ops, NAMESPACE, CLUSTER, "hippo-def")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoPodsFound(_)));
        assert!(ops.exec_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failover_stderr_is_failure() {
        let (ops, _ctx) = fake_context();
        with_pods(&ops);
        ops.push_exec_output(ExecOutput::new("", "Error: no healthy candidate"));

        let err = failover(&*ops, NAMESPACE, CLUSTER, "").await.unwrap_err();

        assert!(matches!(err, Error::CommandError(ref msg) if msg.contains("candidate")));
    }

    #[tokio::test]
    async fn test_failover_failed_exit_is_failure() {
        let (ops, _ctx) = fake_context();
        with_pods(&ops);
        ops.push_exec_output(ExecOutput::failed(
            "",
            "",
            "command terminated with non-zero exit code: exit status 1",
        ));

        let err = failover(&*ops, NAMESPACE, CLUSTER, "hippo-abc")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CommandError(ref msg) if msg.contains("exit status 1")));
    }
}

// =============================================================================
// Switchover
// =============================================================================

mod switchover_tests {
    use super::*;

    #[tokio::test]
    async fn test_switchover_runs_on_primary() {
        let (ops, _ctx) = fake_context();
        with_pods(&ops);

        switchover(&*ops, NAMESPACE, CLUSTER, "").await.unwrap();

        let exec = ops.exec_calls();
        assert_eq!(exec[0].pod, "hippo-7f9c-0");
        assert_eq!(
            exec[0].command,
            vec!["patronictl", "switchover", "--force", "hippo"]
        );
    }

    #[tokio::test]
    async fn test_switchover_to_candidate() {
        let (ops, _ctx) = fake_context();
        with_pods(&ops);

        switchover(&*ops, NAMESPACE, CLUSTER, "hippo-abc")
            .await
            .unwrap();

        let exec = ops.exec_calls();
        assert_eq!(exec[0].pod, "hippo-abc-123");
        assert_eq!(exec[0].command[4..], ["--candidate", "hippo-abc-123"]);
    }

    #[tokio::test]
    async fn test_switchover_without_primary() {
        let (ops, _ctx) = fake_context();
        ops.add_pod(pod(
            "hippo-abc-123",
            "hippo-abc",
            "Running",
            labels::ROLE_REPLICA,
            "node-2",
        ));

        let err = switchover(&*ops, NAMESPACE, CLUSTER, "").await.unwrap_err();
        assert!(matches!(err, Error::NoPodsFound(_)));
    }

    #[tokio::test]
    async fn test_remove_primary_on_role_change_tag() {
        let (ops, _ctx) = fake_context();
        with_pods(&ops);

        remove_primary_on_role_change_tag(&*ops, NAMESPACE, CLUSTER)
            .await
            .unwrap();

        let exec = ops.exec_calls();
        assert_eq!(exec[0].pod, "hippo-7f9c-0");
        assert_eq!(exec[0].command[1], "edit-config");
    }
}

// =============================================================================
// Automated failover
// =============================================================================

mod autofailover_tests {
    use super::*;

    fn stored_config(ops: &FakeClusterOps) -> Value {
        let cm = ops.config_map(NAMESPACE, "hippo-config").unwrap();
        let annotations = cm.metadata.annotations.unwrap();
        serde_json::from_str(&annotations[labels::ANNOTATION_PATRONI_CONFIG]).unwrap()
    }

    #[tokio::test]
    async fn test_disable_pauses_patroni() {
        let (ops, _ctx) = fake_context();
        ops.add_config_map(patroni_config_map(CLUSTER, r#"{"ttl":30,"loop_wait":10}"#));

        toggle_autofailover(&*ops, &cluster(CLUSTER, true), false)
            .await
            .unwrap();

        let config = stored_config(&ops);
        assert_eq!(config["pause"], Value::Bool(true));
        assert_eq!(config["ttl"], 30);
    }

    #[tokio::test]
    async fn test_enable_resumes_patroni() {
        let (ops, _ctx) = fake_context();
        ops.add_config_map(patroni_config_map(CLUSTER, r#"{"ttl":30,"pause":true}"#));

        toggle_autofailover(&*ops, &cluster(CLUSTER, true), true)
            .await
            .unwrap();

        assert!(stored_config(&ops).get("pause").is_none());
    }

    #[tokio::test]
    async fn test_already_enabled_is_noop() {
        let (ops, _ctx) = fake_context();
        ops.add_config_map(patroni_config_map(CLUSTER, r#"{"ttl":30}"#));

        toggle_autofailover(&*ops, &cluster(CLUSTER, true), true)
            .await
            .unwrap();

        assert!(ops.calls_of("replace_config_map").is_empty());
    }

    #[tokio::test]
    async fn test_scope_label_names_config_map() {
        let (ops, _ctx) = fake_context();
        ops.add_config_map(patroni_config_map("hippo-ha", r#"{}"#));
        let mut c = cluster(CLUSTER, true);
        c.metadata
            .labels
            .get_or_insert_default()
            .insert(labels::PGHA_SCOPE.to_string(), "hippo-ha".to_string());

        toggle_autofailover(&*ops, &c, false).await.unwrap();

        assert_eq!(
            ops.calls_of("replace_config_map"),
            vec!["replace_config_map pgo/hippo-ha-config"]
        );
    }

    #[tokio::test]
    async fn test_missing_config_annotation() {
        let (ops, _ctx) = fake_context();
        let mut cm = patroni_config_map(CLUSTER, "{}");
        cm.metadata.annotations = None;
        ops.add_config_map(cm);

        let err = toggle_autofailover(&*ops, &cluster(CLUSTER, true), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingConfigAnnotation(_)));
    }

    #[tokio::test]
    async fn test_missing_config_map() {
        let (ops, _ctx) = fake_context();
        let err = toggle_autofailover(&*ops, &cluster(CLUSTER, true), false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
