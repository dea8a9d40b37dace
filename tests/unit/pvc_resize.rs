//! Unit tests for PVC resizing

use kube::ResourceExt;

use postgres_operator::controller::{
    ResizeState, ResizeStep, apply_cluster_resize, resize_replica_pvc,
};
use postgres_operator::crd::Pgreplica;
use postgres_operator::resources::ExecOutput;
use postgres_operator::resources::labels;

use crate::common::*;

fn resized(old: &Pgreplica, size: &str) -> Pgreplica {
    let mut new = old.clone();
    new.spec.replica_storage.size = size.to_string();
    new
}

/// Mutating calls in the order they were made
fn mutations(ops: &FakeClusterOps) -> Vec<String> {
    ops.calls()
        .into_iter()
        .filter(|c| !c.starts_with("get_") && !c.starts_with("list_"))
        .collect()
}

fn with_instance(ops: &FakeClusterOps, name: &str, size: &str) {
    ops.add_deployment(replica_deployment(name, CLUSTER));
    ops.add_pvc(pvc(name, size));
    ops.add_pod(pod(&format!("{}-0", name), name, "Running", "replica", "node-1"));
}

// =============================================================================
// Replica resize
// =============================================================================

mod replica_resize_tests {
    use super::*;

    #[tokio::test]
    async fn test_unchanged_size_runs_nothing() {
        let (ops, _ctx) = fake_context();
        let r = replica("hippo-abcd", CLUSTER, "1Gi");

        let report = resize_replica_pvc(&*ops, &r, &r).await;

        assert_eq!(report.state, ResizeState::SizeUnchanged);
        assert_eq!(report.last_completed, None);
        assert!(ops.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resize_applied_in_order() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "1Gi");
        let old = replica("hippo-abcd", CLUSTER, "1Gi");
        let new = resized(&old, "2Gi");

        let report = resize_replica_pvc(&*ops, &old, &new).await;

        assert_eq!(report.state, ResizeState::Applied);
        assert!(report.is_complete());
        assert!(report.warnings.is_empty());
        assert_eq!(
            mutations(&ops),
            vec![
                "replace_pvc pgo/hippo-abcd",
                "exec pgo/hippo-abcd-0",
                "patch_deployment pgo/hippo-abcd",
                "patch_deployment pgo/hippo-abcd",
            ]
        );
        assert_eq!(
            pvc_size(&ops.pvc(NAMESPACE, "hippo-abcd").unwrap()).as_deref(),
            Some("2Gi")
        );
        let deployment = ops.deployment(NAMESPACE, "hippo-abcd").unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(1));
    }

    #[tokio::test]
    async fn test_annotation_blocks_resize_and_is_cleared() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "1Gi");
        let old = replica("hippo-abcd", CLUSTER, "1Gi");
        let mut new = resized(&old, "2Gi");
        new.annotations_mut().insert(
            labels::ANNOTATION_DO_NOT_RESIZE.to_string(),
            labels::TRUE.to_string(),
        );

        let report = resize_replica_pvc(&*ops, &old, &new).await;

        assert_eq!(report.state, ResizeState::BlockedByAnnotation);
        assert_eq!(report.last_completed, Some(ResizeStep::CheckAnnotation));
        assert_eq!(mutations(&ops), vec!["replace_replica pgo/hippo-abcd"]);
        let stored = ops.replica(NAMESPACE, "hippo-abcd").unwrap();
        assert!(
            !stored
                .annotations()
                .contains_key(labels::ANNOTATION_DO_NOT_RESIZE)
        );
        assert_eq!(
            pvc_size(&ops.pvc(NAMESPACE, "hippo-abcd").unwrap()).as_deref(),
            Some("1Gi")
        );
    }

    #[tokio::test]
    async fn test_shrink_is_rejected() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "2Gi");
        let old = replica("hippo-abcd", CLUSTER, "2Gi");
        let new = resized(&old, "1Gi");

        let report = resize_replica_pvc(&*ops, &old, &new).await;

        assert_eq!(report.failed_step, Some(ResizeStep::Validate));
        assert_eq!(report.state, ResizeState::Requested);
        assert!(report.error.is_some());
        assert!(ops.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_deployment_fails_lookup() {
        let (ops, _ctx) = fake_context();
        let old = replica("hippo-abcd", CLUSTER, "1Gi");
        let new = resized(&old, "2Gi");

        let report = resize_replica_pvc(&*ops, &old, &new).await;

        assert_eq!(report.failed_step, Some(ResizeStep::Lookup));
        assert_eq!(report.state, ResizeState::Validated);
        assert!(ops.calls_of("replace_pvc").is_empty());
    }

    #[tokio::test]
    async fn test_failed_stop_only_warns() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "1Gi");
        ops.push_exec_output(ExecOutput::new("", "pg_ctl: server is not running"));
        let old = replica("hippo-abcd", CLUSTER, "1Gi");
        let new = resized(&old, "2Gi");

        let report = resize_replica_pvc(&*ops, &old, &new).await;

        assert!(report.is_complete());
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].0, ResizeStep::StopInstance);
        assert_eq!(ops.calls_of("patch_deployment").len(), 2);
    }

    #[tokio::test]
    async fn test_failed_scale_down_aborts() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "1Gi");
        ops.fail_on("patch_deployment");
        let old = replica("hippo-abcd", CLUSTER, "1Gi");
        let new = resized(&old, "2Gi");

        let report = resize_replica_pvc(&*ops, &old, &new).await;

        assert_eq!(report.failed_step, Some(ResizeStep::ScaleDown));
        assert_eq!(report.last_completed, Some(ResizeStep::StopInstance));
        // The claim was already updated
        assert_eq!(report.state, ResizeState::Applied);
        assert!(!report.is_complete());
        assert_eq!(ops.calls_of("patch_deployment").len(), 1);
    }

    #[tokio::test]
    async fn test_scale_up_failure_leaves_instance_stopped() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "1Gi");
        // Scaling down succeeds, scaling back up does not
        ops.fail_on_call("patch_deployment", 2);
        let old = replica("hippo-abcd", CLUSTER, "1Gi");
        let new = resized(&old, "2Gi");

        let report = resize_replica_pvc(&*ops, &old, &new).await;

        assert_eq!(report.failed_step, None);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].0, ResizeStep::ScaleUp);
        assert_eq!(report.last_completed, Some(ResizeStep::ScaleDown));
        assert_eq!(report.state, ResizeState::Applied);
        assert!(!report.is_complete());
        assert_eq!(ops.calls_of("patch_deployment").len(), 2);
        let d = ops.deployment(NAMESPACE, "hippo-abcd").unwrap();
        assert_eq!(d.spec.unwrap().replicas, Some(0));
    }

    #[tokio::test]
    async fn test_failed_claim_update_keeps_instance_running() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "1Gi");
        ops.fail_on("replace_pvc");
        let old = replica("hippo-abcd", CLUSTER, "1Gi");
        let new = resized(&old, "2Gi");

        let report = resize_replica_pvc(&*ops, &old, &new).await;

        assert_eq!(report.failed_step, Some(ResizeStep::ResizeClaim));
        assert!(ops.exec_calls().is_empty());
        assert!(ops.calls_of("patch_deployment").is_empty());
    }
}

// =============================================================================
// Cluster resize
// =============================================================================

mod cluster_resize_tests {
    use super::*;

    fn cluster_of_size(size: &str) -> postgres_operator::crd::Pgcluster {
        let mut c = cluster(CLUSTER, true);
        c.spec.primary_storage.size = size.to_string();
        c
    }

    #[tokio::test]
    async fn test_smaller_replica_follows_cluster() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "1Gi");
        ops.add_replica(replica("hippo-abcd", CLUSTER, "1Gi"));
        let d = ops.deployment(NAMESPACE, "hippo-abcd").unwrap();

        apply_cluster_resize(&*ops, &cluster_of_size("2Gi"), &d)
            .await
            .unwrap();

        let stored = ops.replica(NAMESPACE, "hippo-abcd").unwrap();
        assert_eq!(stored.spec.replica_storage.size, "2Gi");
        assert_eq!(
            stored.annotations()[labels::ANNOTATION_DO_NOT_RESIZE],
            labels::TRUE
        );
        assert_eq!(
            pvc_size(&ops.pvc(NAMESPACE, "hippo-abcd").unwrap()).as_deref(),
            Some("2Gi")
        );
    }

    #[tokio::test]
    async fn test_larger_replica_is_skipped() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "5Gi");
        ops.add_replica(replica("hippo-abcd", CLUSTER, "5Gi"));
        let d = ops.deployment(NAMESPACE, "hippo-abcd").unwrap();

        apply_cluster_resize(&*ops, &cluster_of_size("2Gi"), &d)
            .await
            .unwrap();

        assert!(ops.calls_of("replace_replica").is_empty());
        assert!(ops.calls_of("replace_pvc").is_empty());
    }

    #[tokio::test]
    async fn test_primary_without_replica_object() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, CLUSTER, "1Gi");
        let d = ops.deployment(NAMESPACE, CLUSTER).unwrap();

        apply_cluster_resize(&*ops, &cluster_of_size("3Gi"), &d)
            .await
            .unwrap();

        assert_eq!(
            pvc_size(&ops.pvc(NAMESPACE, CLUSTER).unwrap()).as_deref(),
            Some("3Gi")
        );
    }

    #[tokio::test]
    async fn test_failed_replica_update_skips_claim() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, "hippo-abcd", "1Gi");
        ops.add_replica(replica("hippo-abcd", CLUSTER, "1Gi"));
        ops.fail_on("replace_replica");
        let d = ops.deployment(NAMESPACE, "hippo-abcd").unwrap();

        apply_cluster_resize(&*ops, &cluster_of_size("2Gi"), &d)
            .await
            .unwrap();

        assert!(ops.calls_of("replace_pvc").is_empty());
    }

    #[tokio::test]
    async fn test_missing_claim_is_an_error() {
        let (ops, _ctx) = fake_context();
        ops.add_deployment(replica_deployment(CLUSTER, CLUSTER));
        let d = ops.deployment(NAMESPACE, CLUSTER).unwrap();

        let err = apply_cluster_resize(&*ops, &cluster_of_size("2Gi"), &d)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_cluster_size_is_an_error() {
        let (ops, _ctx) = fake_context();
        with_instance(&ops, CLUSTER, "1Gi");
        let d = ops.deployment(NAMESPACE, CLUSTER).unwrap();

        assert!(
            apply_cluster_resize(&*ops, &cluster_of_size("lots"), &d)
                .await
                .is_err()
        );
        assert!(ops.calls().iter().all(|c| c.starts_with("get_")));
    }
}
