//! Unit tests for the replica controller

use std::sync::Arc;

use postgres_operator::config::OperatorConfig;
use postgres_operator::controller::{ReplicaController, ResourceEventHandler};
use postgres_operator::crd::{
    COMPLETED_STATUS, PgreplicaStatus, ReplicaState, ServiceType, to_k8s_tolerations,
};
use postgres_operator::resources::ExecOutput;
use postgres_operator::resources::labels;

use crate::common::*;

fn controller() -> (Arc<FakeClusterOps>, ReplicaController) {
    let (ops, ctx) = fake_context();
    (ops, ReplicaController::new(ctx))
}

// =============================================================================
// Queueing
// =============================================================================

mod queue_tests {
    use super::*;

    #[tokio::test]
    async fn test_on_add_skips_processed_replica() {
        let (_ops, controller) = controller();
        let mut r = replica("hippo-abcd", CLUSTER, "1Gi");
        r.status = Some(PgreplicaStatus::processed());

        controller.on_add(&r).await;

        assert_eq!(controller.queue().len().await, 0);
    }

    #[tokio::test]
    async fn test_on_add_queues_key_once() {
        let (_ops, controller) = controller();
        let r = replica("hippo-abcd", CLUSTER, "1Gi");

        controller.on_add(&r).await;
        controller.on_add(&r).await;

        assert_eq!(controller.queue().len().await, 1);
        assert_eq!(controller.queue().get().await.unwrap(), "pgo/hippo-abcd");
    }

    #[tokio::test]
    async fn test_process_next_item_stops_after_shutdown() {
        let (_ops, controller) = controller();
        controller.queue().shut_down().await;
        assert!(!controller.process_next_item().await);
    }
}

// =============================================================================
// Processing
// =============================================================================

mod process_tests {
    use super::*;

    #[tokio::test]
    async fn test_existing_deployment_is_left_alone() {
        let (ops, controller) = controller();
        ops.add_deployment(replica_deployment("hippo-abcd", CLUSTER));
        controller.queue().add("pgo/hippo-abcd".to_string()).await;

        assert!(controller.process_next_item().await);

        assert!(ops.calls_of("get_replica").is_empty());
        assert!(ops.calls_of("create_deployment").is_empty());
    }

    #[tokio::test]
    async fn test_missing_replica_is_forgotten() {
        let (ops, controller) = controller();
        controller.queue().add("pgo/hippo-gone".to_string()).await;

        assert!(controller.process_next_item().await);

        let key = "pgo/hippo-gone".to_string();
        assert_eq!(controller.queue().num_requeues(&key).await, 0);
        assert_eq!(controller.queue().len().await, 0);
        assert!(ops.calls_of("patch_replica_status").is_empty());
    }

    #[tokio::test]
    async fn test_uninitialized_cluster_marks_pending_init() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, false));
        ops.add_replica(replica("hippo-abcd", CLUSTER, "1Gi"));
        controller.queue().add("pgo/hippo-abcd".to_string()).await;

        assert!(controller.process_next_item().await);

        let stored = ops.replica(NAMESPACE, "hippo-abcd").unwrap();
        assert_eq!(stored.state(), Some(ReplicaState::PendingInit));
        assert!(ops.deployment(NAMESPACE, "hippo-abcd").is_none());
    }

    #[tokio::test]
    async fn test_initialized_cluster_provisions_replica() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        ops.add_replica(replica("hippo-abcd", CLUSTER, "1Gi"));
        controller.queue().add("pgo/hippo-abcd".to_string()).await;

        assert!(controller.process_next_item().await);

        assert!(ops.pvc(NAMESPACE, "hippo-abcd").is_some());
        assert!(ops.service(NAMESPACE, "hippo-replica").is_some());
        let deployment = ops.deployment(NAMESPACE, "hippo-abcd").unwrap();
        assert_eq!(
            deployment.metadata.labels.unwrap()[labels::SERVICE_NAME],
            "hippo-replica"
        );

        let stored = ops.replica(NAMESPACE, "hippo-abcd").unwrap();
        assert!(stored.is_processed());
        assert_eq!(stored.spec.status, COMPLETED_STATUS);
        assert_eq!(stored.spec.replica_storage.name, "hippo-abcd");
    }

    #[tokio::test]
    async fn test_existing_replica_service_is_reused() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        ops.add_replica(replica("hippo-abcd", CLUSTER, "1Gi"));
        ops.add_service(service("hippo-replica", "NodePort"));
        controller.queue().add("pgo/hippo-abcd".to_string()).await;

        controller.process_next_item().await;

        assert!(ops.calls_of("create_service").is_empty());
        assert!(ops.deployment(NAMESPACE, "hippo-abcd").is_some());
    }

    #[tokio::test]
    async fn test_scale_failure_still_marks_processed_by_default() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        ops.add_replica(replica("hippo-abcd", CLUSTER, "1Gi"));
        ops.fail_on("create_deployment");
        controller.queue().add("pgo/hippo-abcd".to_string()).await;

        controller.process_next_item().await;

        let stored = ops.replica(NAMESPACE, "hippo-abcd").unwrap();
        assert!(stored.is_processed());
        assert_ne!(stored.spec.status, COMPLETED_STATUS);
        let key = "pgo/hippo-abcd".to_string();
        assert_eq!(controller.queue().num_requeues(&key).await, 0);
    }

    #[tokio::test]
    async fn test_requeue_on_error() {
        let (ops, ctx) = context_with(OperatorConfig {
            requeue_on_error: true,
            ..Default::default()
        });
        let controller = ReplicaController::new(ctx);
        ops.add_cluster(cluster(CLUSTER, true));
        ops.add_replica(replica("hippo-abcd", CLUSTER, "1Gi"));
        ops.fail_on("create_deployment");
        let key = "pgo/hippo-abcd".to_string();
        controller.queue().add(key.clone()).await;

        controller.process_next_item().await;

        assert_eq!(controller.queue().num_requeues(&key).await, 1);
        let stored = ops.replica(NAMESPACE, "hippo-abcd").unwrap();
        assert!(!stored.is_processed());
    }

    #[tokio::test]
    async fn test_invalid_replica_name_is_not_provisioned() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        ops.add_replica(replica("-bad-", CLUSTER, "1Gi"));
        controller.queue().add("pgo/-bad-".to_string()).await;

        controller.process_next_item().await;

        assert!(ops.calls_of("create_deployment").is_empty());
        assert!(ops.calls_of("create_pvc").is_empty());
    }
}

// =============================================================================
// Updates
// =============================================================================

mod update_tests {
    use super::*;

    #[tokio::test]
    async fn test_update_provisions_when_cluster_became_ready() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        let r = replica("hippo-abcd", CLUSTER, "1Gi");
        ops.add_replica(r.clone());

        controller.on_update(&r, &r).await;

        assert!(ops.deployment(NAMESPACE, "hippo-abcd").is_some());
        assert!(ops.replica(NAMESPACE, "hippo-abcd").unwrap().is_processed());
    }

    #[tokio::test]
    async fn test_update_without_changes_is_noop() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        let mut r = replica("hippo-abcd", CLUSTER, "1Gi");
        r.spec.status = COMPLETED_STATUS.to_string();

        controller.on_update(&r, &r).await;

        assert_eq!(ops.calls(), vec!["get_cluster pgo/hippo"]);
    }

    #[tokio::test]
    async fn test_update_service_type_patches_service() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        ops.add_service(service("hippo-replica", "ClusterIP"));
        let mut old = replica("hippo-abcd", CLUSTER, "1Gi");
        old.spec.status = COMPLETED_STATUS.to_string();
        let mut new = old.clone();
        new.spec.service_type = Some(ServiceType::LoadBalancer);

        controller.on_update(&old, &new).await;

        let svc = ops.service(NAMESPACE, "hippo-replica").unwrap();
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("LoadBalancer"));
    }

    #[tokio::test]
    async fn test_update_service_type_unchanged_service() {
        let (ops, ctx) = fake_context();
        let controller = ReplicaController::new(ctx);
        let c = cluster(CLUSTER, true);
        ops.add_service(service("hippo-replica", "NodePort"));
        let mut r = replica("hippo-abcd", CLUSTER, "1Gi");
        r.spec.service_type = Some(ServiceType::NodePort);

        controller.update_replica_service(&r, &c).await.unwrap();

        assert!(ops.calls_of("patch_service").is_empty());
    }

    #[tokio::test]
    async fn test_update_service_creates_missing_service() {
        let (ops, ctx) = fake_context();
        let controller = ReplicaController::new(ctx);
        let mut c = cluster(CLUSTER, true);
        c.spec.service_type = Some(ServiceType::NodePort);
        let r = replica("hippo-abcd", CLUSTER, "1Gi");

        controller.update_replica_service(&r, &c).await.unwrap();

        let svc = ops.service(NAMESPACE, "hippo-replica").unwrap();
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("NodePort"));
    }

    #[tokio::test]
    async fn test_update_tolerations_stops_instance_then_replaces() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        ops.add_deployment(replica_deployment("hippo-abcd", CLUSTER));
        ops.add_pod(pod("hippo-abcd-0", "hippo-abcd", "Running", "replica", "node-1"));
        let mut old = replica("hippo-abcd", CLUSTER, "1Gi");
        old.spec.status = COMPLETED_STATUS.to_string();
        let mut new = old.clone();
        new.spec.tolerations = vec![toleration("dedicated", "db")];

        controller.on_update(&old, &new).await;

        let exec = ops.exec_calls();
        assert_eq!(exec.len(), 1);
        assert_eq!(exec[0].pod, "hippo-abcd-0");
        assert_eq!(exec[0].command[0], "pg_ctl");

        let deployment = ops.deployment(NAMESPACE, "hippo-abcd").unwrap();
        let tolerations = deployment
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .tolerations
            .unwrap();
        assert_eq!(
            tolerations,
            to_k8s_tolerations(&[toleration("dedicated", "db")])
        );
    }

    #[tokio::test]
    async fn test_update_tolerations_falls_back_to_cluster() {
        let (ops, ctx) = fake_context();
        let controller = ReplicaController::new(ctx);
        let mut c = cluster(CLUSTER, true);
        c.spec.tolerations = vec![toleration("zone", "a")];
        ops.add_deployment(replica_deployment("hippo-abcd", CLUSTER));
        let r = replica("hippo-abcd", CLUSTER, "1Gi");

        controller.update_replica_tolerations(&r, &c).await.unwrap();

        let deployment = ops.deployment(NAMESPACE, "hippo-abcd").unwrap();
        let tolerations = deployment
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .tolerations
            .unwrap();
        assert_eq!(tolerations, to_k8s_tolerations(&c.spec.tolerations));
    }

    #[tokio::test]
    async fn test_update_tolerations_failed_stop_still_replaces() {
        let (ops, ctx) = fake_context();
        let controller = ReplicaController::new(ctx);
        let c = cluster(CLUSTER, true);
        ops.add_deployment(replica_deployment("hippo-abcd", CLUSTER));
        ops.add_pod(pod("hippo-abcd-0", "hippo-abcd", "Running", "replica", "node-1"));
        ops.push_exec_output(ExecOutput::new("", "pg_ctl: could not send stop signal"));
        let mut r = replica("hippo-abcd", CLUSTER, "1Gi");
        r.spec.tolerations = vec![toleration("dedicated", "db")];

        controller.update_replica_tolerations(&r, &c).await.unwrap();

        assert_eq!(ops.calls_of("replace_deployment").len(), 1);
    }

    #[tokio::test]
    async fn test_update_tolerations_requires_deployment() {
        let (_ops, ctx) = fake_context();
        let controller = ReplicaController::new(ctx);
        let c = cluster(CLUSTER, true);
        let r = replica("hippo-abcd", CLUSTER, "1Gi");

        let err = controller
            .update_replica_tolerations(&r, &c)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_with_missing_cluster_does_nothing() {
        let (ops, controller) = controller();
        let old = replica("hippo-abcd", CLUSTER, "1Gi");
        let mut new = old.clone();
        new.spec.replica_storage.size = "2Gi".to_string();

        controller.on_update(&old, &new).await;

        assert_eq!(ops.calls(), vec!["get_cluster pgo/hippo"]);
    }
}

// =============================================================================
// Deletion
// =============================================================================

mod delete_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_removes_replica_deployment() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        ops.add_deployment(replica_deployment("hippo-abcd", CLUSTER));

        controller
            .on_delete(&replica("hippo-abcd", CLUSTER, "1Gi"))
            .await;

        assert!(ops.deployment(NAMESPACE, "hippo-abcd").is_none());
    }

    #[tokio::test]
    async fn test_delete_skips_promoted_replica() {
        let (ops, controller) = controller();
        ops.add_cluster(cluster(CLUSTER, true));
        ops.add_deployment(deployment(
            "hippo-abcd",
            &[
                (labels::PG_CLUSTER, CLUSTER),
                (labels::SERVICE_NAME, CLUSTER),
            ],
        ));

        controller
            .on_delete(&replica("hippo-abcd", CLUSTER, "1Gi"))
            .await;

        assert!(ops.deployment(NAMESPACE, "hippo-abcd").is_some());
        assert!(ops.calls_of("delete_deployment").is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_deployment_is_noop() {
        let (ops, controller) = controller();
        controller
            .on_delete(&replica("hippo-abcd", CLUSTER, "1Gi"))
            .await;
        assert_eq!(ops.calls(), vec!["get_deployment pgo/hippo-abcd"]);
    }

    #[tokio::test]
    async fn test_delete_after_cluster_removed() {
        let (ops, controller) = controller();
        ops.add_deployment(replica_deployment("hippo-abcd", CLUSTER));

        controller
            .on_delete(&replica("hippo-abcd", CLUSTER, "1Gi"))
            .await;

        assert!(ops.calls_of("delete_deployment").is_empty());
    }
}
