mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use vscode_swarm_control::{
    HealthStatus, InstanceStatus, RecoveryStrategy, METADATA_NEEDS_ATTENTION,
};
use vscode_swarm_provider::MockOp;
use vscode_swarm_store::METADATA_ERROR;

#[tokio::test]
async fn healthy_instance_is_recorded() {
    let harness = Harness::start().await;
    let instance = harness.running_instance("dev1").await;

    let records = harness.controller.run_health_check().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HealthStatus::Healthy);

    let record = harness
        .controller
        .get_health(&instance.id)
        .unwrap()
        .unwrap();
    assert_eq!(record.consecutive_failures, 0);
    assert_eq!(record.history.len(), 1);
}

#[tokio::test]
async fn creating_instance_that_fails_check_is_unknown() {
    let harness = Harness::start().await;
    harness
        .controller
        .create_instance(
            &vscode_swarm_control::InstanceConfig::new("dev1", "/src/dev1"),
            None,
        )
        .await
        .unwrap();

    let records = harness.controller.run_health_check().await.unwrap();
    assert_eq!(records[0].status, HealthStatus::Unknown);
    assert_eq!(records[0].consecutive_failures, 0);
    assert_eq!(harness.docker.call_count(MockOp::Start), 0);
}

#[tokio::test]
async fn restart_recovers_unhealthy_instance() {
    let harness = Harness::start().await;
    let instance = harness.running_instance("dev1").await;
    harness.docker.set_healthy(&instance.id, false);

    harness.controller.run_health_check().await.unwrap();
    assert_eq!(harness.docker.call_count(MockOp::Start), 1);

    let record = harness
        .controller
        .get_health(&instance.id)
        .unwrap()
        .unwrap();
    assert_eq!(record.recovery_attempts, 1);
    assert_eq!(record.consecutive_failures, 0);
    assert!(!record.needs_attention);

    let listed = harness.controller.list_instances(None).unwrap();
    assert_eq!(listed[0].id, instance.id);
    assert_eq!(listed[0].status, InstanceStatus::Running);
}

#[tokio::test]
async fn recreate_replaces_instance_when_restart_fails() {
    let harness = Harness::start().await;
    let instance = harness.running_instance("dev1").await;
    harness.docker.fail_on(MockOp::Start, "container is wedged");

    let outcome = harness
        .controller
        .recover_instance(&instance.id)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.strategy, Some(RecoveryStrategy::Recreate));
    let replacement = outcome.replacement_id.unwrap();
    assert_ne!(replacement, instance.id);

    let listed = harness.controller.list_instances(None).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, replacement);
    assert_eq!(listed[0].name, "dev1");
    assert!(harness.docker.instance(&instance.id).is_none());
}

#[tokio::test]
async fn recovery_gives_up_after_max_attempts() {
    let harness = Harness::start().await;
    let instance = harness.running_instance("dev1").await;
    harness.docker.set_healthy(&instance.id, false);
    harness.docker.fail_on(MockOp::Start, "container is wedged");
    harness.docker.fail_on(MockOp::Create, "image missing");
    let creates_before = harness.docker.call_count(MockOp::Create);

    for _ in 0..5 {
        harness.controller.run_health_check().await.unwrap();
    }

    assert_eq!(harness.docker.call_count(MockOp::Start), 3);
    assert_eq!(harness.docker.call_count(MockOp::Create) - creates_before, 3);

    let failed = harness
        .controller
        .get_instance(&instance.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert_eq!(
        failed.metadata.get(METADATA_NEEDS_ATTENTION).map(String::as_str),
        Some("true")
    );
    assert!(failed.metadata.contains_key(METADATA_ERROR));

    let record = harness
        .controller
        .get_health(&instance.id)
        .unwrap()
        .unwrap();
    assert_eq!(record.recovery_attempts, 3);
    assert!(record.needs_attention);

    // A manual request does not restart the ladder
    let outcome = harness
        .controller
        .recover_instance(&instance.id)
        .await
        .unwrap();
    assert!(outcome.gave_up);
    assert_eq!(harness.docker.call_count(MockOp::Start), 3);
}

#[tokio::test]
async fn user_stop_during_tick_is_not_undone() {
    let harness = Harness::start().await;
    let instance = harness.running_instance("dev1").await;
    harness.docker.set_healthy(&instance.id, false);
    harness
        .docker
        .set_delay(MockOp::Health, Duration::from_millis(300));

    let controller = Arc::clone(&harness.controller);
    let tick = tokio::spawn(async move { controller.run_health_check().await });

    // Stop lands while the tick still holds its unhealthy verdict
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.controller.stop_instance(&instance.id).await.unwrap();
    tick.await.unwrap().unwrap();

    assert_eq!(harness.docker.call_count(MockOp::Start), 0);
    let after = harness.controller.list_instances(None).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, instance.id);
    assert_eq!(after[0].status, InstanceStatus::Stopped);
    assert!(!after[0].metadata.contains_key(METADATA_NEEDS_ATTENTION));

    let record = harness
        .controller
        .get_health(&instance.id)
        .unwrap()
        .unwrap();
    assert_eq!(record.recovery_attempts, 0);
    assert!(!record.needs_attention);
}

#[tokio::test]
async fn exhausted_recovery_does_not_fail_stopped_instance() {
    let harness = Harness::start().await;
    let instance = harness.running_instance("dev1").await;
    harness.docker.set_healthy(&instance.id, false);
    harness.docker.fail_on(MockOp::Start, "container is wedged");
    harness.docker.fail_on(MockOp::Create, "image missing");

    for _ in 0..2 {
        harness.controller.run_health_check().await.unwrap();
    }
    harness.controller.stop_instance(&instance.id).await.unwrap();

    let outcome = harness
        .controller
        .recover_instance(&instance.id)
        .await
        .unwrap();
    assert!(!outcome.success);
    assert!(!outcome.gave_up);
    assert_eq!(harness.docker.call_count(MockOp::Start), 2);

    let after = harness
        .controller
        .get_instance(&instance.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, InstanceStatus::Stopped);
    assert!(!after.metadata.contains_key(METADATA_NEEDS_ATTENTION));
}

#[tokio::test]
async fn health_timeout_is_not_unhealthy() {
    let harness = Harness::start_with(|config| {
        config.general.provider_timeout_ms = 50;
    })
    .await;
    let instance = harness.running_instance("dev1").await;
    harness.docker.set_delay(MockOp::Health, Duration::from_millis(500));

    let records = harness.controller.run_health_check().await.unwrap();
    assert_eq!(records[0].status, HealthStatus::Unknown);
    assert_eq!(records[0].consecutive_failures, 0);
    assert_eq!(harness.docker.call_count(MockOp::Start), 0);

    let listed = harness.controller.list_instances(None).unwrap();
    assert_eq!(listed[0].id, instance.id);
}

#[tokio::test]
async fn background_loop_recovers_without_manual_ticks() {
    let harness = Harness::start_with(|config| {
        config.health_monitor.enabled = true;
        config.health_monitor.check_interval_ms = 20;
    })
    .await;
    let instance = harness.running_instance("dev1").await;
    harness.docker.set_healthy(&instance.id, false);

    let recovered = tokio::time::timeout(Duration::from_secs(5), async {
        while harness.docker.call_count(MockOp::Start) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(recovered.is_ok());

    harness.controller.dispose().await;
}

#[tokio::test]
async fn dispose_interrupts_slow_tick() {
    let harness = Harness::start_with(|config| {
        config.health_monitor.enabled = true;
        config.health_monitor.check_interval_ms = 20;
        config.general.provider_timeout_ms = 30_000;
    })
    .await;
    harness.running_instance("dev1").await;
    harness
        .docker
        .set_delay(MockOp::Health, Duration::from_secs(10));
    let before = harness.docker.call_count(MockOp::Health);

    let in_flight = tokio::time::timeout(Duration::from_secs(5), async {
        while harness.docker.call_count(MockOp::Health) == before {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(in_flight.is_ok());

    let disposed = tokio::time::timeout(Duration::from_secs(2), harness.controller.dispose()).await;
    assert!(disposed.is_ok());
    assert!(!harness.controller.is_initialized());
}
