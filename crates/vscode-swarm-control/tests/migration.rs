mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use vscode_swarm_control::{
    ControlError, InstanceStatus, MigrationOptions, MigrationStatus, MigrationStrategy,
    ProviderType, StepKind, StepStatus,
};
use vscode_swarm_provider::MockOp;

#[tokio::test]
async fn stop_and_recreate_moves_instance() {
    let harness = Harness::start().await;
    let source = harness.running_instance("dev1").await;

    let plan = harness
        .controller
        .create_migration_plan(&source.id, ProviderType::Kubernetes, &MigrationOptions::default())
        .unwrap();
    assert_eq!(plan.status, MigrationStatus::Pending);
    assert_eq!(plan.strategy, MigrationStrategy::StopAndRecreate);

    let result = harness.controller.start_migration(&plan.id).await.unwrap();
    assert!(result.success, "{:?}", result.plan.error);
    assert_eq!(result.plan.status, MigrationStatus::Completed);
    assert_eq!(result.plan.current_step_index, result.plan.steps.len());
    assert!(result
        .plan
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed));

    let target = result.target_instance.unwrap();
    assert_eq!(target.provider_type, ProviderType::Kubernetes);
    assert_eq!(target.config, source.config);

    let listed = harness.controller.list_instances(None).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, target.id);
    assert_eq!(harness.docker.instance_count(), 0);
}

#[tokio::test]
async fn failed_create_keeps_source_untouched() {
    let harness = Harness::start().await;
    let source = harness.running_instance("dev1").await;
    harness.kubernetes.fail_on(MockOp::Create, "quota exceeded");

    let options = MigrationOptions {
        strategy: Some(MigrationStrategy::CreateThenStop),
        keep_source: true,
        ..MigrationOptions::default()
    };
    let plan = harness
        .controller
        .create_migration_plan(&source.id, ProviderType::Kubernetes, &options)
        .unwrap();

    let result = harness.controller.start_migration(&plan.id).await.unwrap();
    assert!(!result.success);
    assert!(result.target_instance.is_none());

    let plan = result.plan;
    assert_eq!(plan.status, MigrationStatus::Failed);
    assert_eq!(plan.current_step_index, 1);
    assert_eq!(plan.steps[0].status, StepStatus::Completed);
    assert_eq!(plan.steps[1].kind, StepKind::CreateTarget);
    assert_eq!(plan.steps[1].status, StepStatus::Failed);
    assert!(plan.steps[1].error.as_deref().unwrap().contains("quota exceeded"));
    assert!(plan.error.is_some());

    let after = harness
        .controller
        .get_instance(&source.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, InstanceStatus::Running);
    assert_eq!(after.provider_type, ProviderType::Docker);
    assert_eq!(harness.docker.call_count(MockOp::Stop), 0);
}

#[tokio::test]
async fn plan_is_rejected_for_same_or_inactive_provider() {
    let harness = Harness::build(tempfile::tempdir().unwrap(), |_| {});
    harness.kubernetes.fail_on(MockOp::Initialize, "no cluster");
    harness.controller.initialize().await.unwrap();
    let source = harness.running_instance("dev1").await;

    let same = harness
        .controller
        .create_migration_plan(&source.id, ProviderType::Docker, &MigrationOptions::default())
        .unwrap_err();
    assert!(matches!(same, ControlError::Config(_)));

    let inactive = harness
        .controller
        .create_migration_plan(
            &source.id,
            ProviderType::Kubernetes,
            &MigrationOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(
        inactive,
        ControlError::ProviderUnavailable(ProviderType::Kubernetes)
    ));
    assert!(harness.controller.list_migration_plans().unwrap().is_empty());
}

#[tokio::test]
async fn disabled_migration_refuses_plans() {
    let harness = Harness::start_with(|config| config.migration.enabled = false).await;
    let source = harness.running_instance("dev1").await;

    let err = harness
        .controller
        .create_migration_plan(&source.id, ProviderType::Kubernetes, &MigrationOptions::default())
        .unwrap_err();
    assert!(matches!(err, ControlError::Config(_)));
}

#[tokio::test]
async fn cancelled_plan_cannot_start() {
    let harness = Harness::start().await;
    let source = harness.running_instance("dev1").await;
    let plan = harness
        .controller
        .create_migration_plan(&source.id, ProviderType::Kubernetes, &MigrationOptions::default())
        .unwrap();

    let cancelled = harness.controller.cancel_migration(&plan.id).unwrap();
    assert_eq!(cancelled.status, MigrationStatus::Cancelled);

    assert!(matches!(
        harness.controller.start_migration(&plan.id).await,
        Err(ControlError::InvalidPlanState {
            status: MigrationStatus::Cancelled,
            ..
        })
    ));
    assert!(matches!(
        harness.controller.cancel_migration(&plan.id),
        Err(ControlError::InvalidPlanState { .. })
    ));
    assert_eq!(harness.docker.call_count(MockOp::Stop), 0);
}

#[tokio::test]
async fn cancel_takes_effect_between_steps() {
    let harness = Harness::start().await;
    let source = harness.running_instance("dev1").await;
    harness
        .kubernetes
        .set_delay(MockOp::Create, Duration::from_millis(300));

    let plan = harness
        .controller
        .create_migration_plan(&source.id, ProviderType::Kubernetes, &MigrationOptions::default())
        .unwrap();

    let controller = Arc::clone(&harness.controller);
    let plan_id = plan.id;
    let running = tokio::spawn(async move { controller.start_migration(&plan_id).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled = harness.controller.cancel_migration(&plan.id).unwrap();

    let result = running.await.unwrap().unwrap();
    assert!(!result.success);
    assert_eq!(result.plan.status, MigrationStatus::Cancelled);

    // The plan is frozen at cancellation; the created target is still reported
    assert_eq!(result.plan, cancelled);
    assert_eq!(
        harness.controller.get_migration_plan(&plan.id).unwrap().unwrap(),
        cancelled
    );
    assert!(result.plan.target_instance_id.is_none());
    let target = result.target_instance.unwrap();
    assert_eq!(target.provider_type, ProviderType::Kubernetes);

    // The in-flight create finished; nothing after it ran
    let start_step = result
        .plan
        .steps
        .iter()
        .find(|s| s.kind == StepKind::StartTarget)
        .unwrap();
    assert_eq!(start_step.status, StepStatus::Pending);
    assert_eq!(harness.docker.call_count(MockOp::Delete), 0);
}

#[tokio::test]
async fn failure_after_cancel_does_not_rewrite_plan() {
    let harness = Harness::start().await;
    let source = harness.running_instance("dev1").await;
    harness
        .kubernetes
        .set_delay(MockOp::Create, Duration::from_millis(300));
    harness.kubernetes.fail_on(MockOp::Create, "quota exceeded");

    let plan = harness
        .controller
        .create_migration_plan(&source.id, ProviderType::Kubernetes, &MigrationOptions::default())
        .unwrap();

    let controller = Arc::clone(&harness.controller);
    let plan_id = plan.id;
    let running = tokio::spawn(async move { controller.start_migration(&plan_id).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled = harness.controller.cancel_migration(&plan.id).unwrap();

    let result = running.await.unwrap().unwrap();
    assert_eq!(result.plan, cancelled);
    assert_eq!(result.plan.status, MigrationStatus::Cancelled);
    assert!(result.plan.error.is_none());
    assert!(result
        .plan
        .steps
        .iter()
        .all(|s| s.status != StepStatus::Failed));
    assert!(result.target_instance.is_none());
}

#[tokio::test]
async fn plans_are_listed_and_unknown_ids_reported() {
    let harness = Harness::start().await;
    let first = harness.running_instance("dev1").await;
    let second = harness.running_instance("dev2").await;

    let a = harness
        .controller
        .create_migration_plan(&first.id, ProviderType::Kubernetes, &MigrationOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let b = harness
        .controller
        .create_migration_plan(&second.id, ProviderType::Kubernetes, &MigrationOptions::default())
        .unwrap();

    let ids: Vec<_> = harness
        .controller
        .list_migration_plans()
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec![a.id, b.id]);
    assert_eq!(
        harness.controller.get_migration_plan(&a.id).unwrap().unwrap(),
        a
    );

    let unknown = vscode_swarm_control::PlanId::generate();
    assert!(harness.controller.get_migration_plan(&unknown).unwrap().is_none());
    assert!(matches!(
        harness.controller.start_migration(&unknown).await,
        Err(ControlError::PlanNotFound(id)) if id == unknown
    ));
}

#[tokio::test]
async fn plans_are_unavailable_after_dispose() {
    let harness = Harness::start().await;
    let source = harness.running_instance("dev1").await;
    let plan = harness
        .controller
        .create_migration_plan(&source.id, ProviderType::Kubernetes, &MigrationOptions::default())
        .unwrap();

    harness.controller.dispose().await;

    assert!(matches!(
        harness.controller.get_migration_plan(&plan.id),
        Err(ControlError::NotInitialized)
    ));
}
