//! Test: busy pipelines queue uploads and services run independently

use crate::helpers::*;
use mimir::collaborators::{BuildOutcome, ServiceRef};
use mimir::core::{FailureKind, RunPhase};
use mimir::execution::Dispatch;

/// Uploads during a run queue one follow-up run and coalesce the rest
#[tokio::test]
async fn test_busy_pipeline_queues_and_coalesces() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    fleet.builds.set_outcome("api-build", BuildOutcome::Hang).await;
    let handle = fleet.engine().start();

    let first = fleet.upload("api/source.zip", b"v1").await;
    assert_eq!(handle.dispatch(first).await, Dispatch::Started("api".to_string()));
    handle
        .wait_for_phase("api", |phase| *phase == RunPhase::Building)
        .await
        .unwrap();

    let second = fleet.upload("api/source.zip", b"v2").await;
    assert_eq!(handle.dispatch(second.clone()).await, Dispatch::Queued("api".to_string()));
    let third = fleet.upload("api/source.zip", b"v3").await;
    assert_eq!(handle.dispatch(third).await, Dispatch::Coalesced("api".to_string()));

    // Let the queued run build normally once the hanging one is gone
    fleet.builds.set_outcome("api-build", BuildOutcome::Succeed).await;
    let builds = fleet.builds.clone();
    eventually(|| {
        let builds = builds.clone();
        async move { !builds.started().await.is_empty() }
    })
    .await;
    // The build is accepted, so cancelling now must release it
    assert!(handle.cancel("api"));

    let runs = handle.shutdown().await;
    let runs = &runs["api"];
    assert_eq!(runs.len(), 2);

    let cancelled = runs[0].failure.as_ref().unwrap();
    assert_eq!(cancelled.stage, RunPhase::Building);
    assert_eq!(cancelled.kind, FailureKind::Cancelled);
    assert_eq!(fleet.builds.stopped().await.len(), 1);

    assert!(runs[1].succeeded());
    // The coalesced run builds the latest upload
    let started = fleet.builds.started().await;
    assert_eq!(started.len(), 2);
    assert_eq!(started[1].input.payload, b"v3");
}

/// Cancelling an idle pipeline does nothing
#[tokio::test]
async fn test_cancel_idle_pipeline_is_noop() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    let handle = fleet.engine().start();

    assert!(!handle.cancel("api"));
    assert!(!handle.cancel("worker"));

    let runs = handle.shutdown().await;
    assert!(runs["api"].is_empty());
}

/// A stuck pipeline does not hold up another service's deployment
#[tokio::test]
async fn test_services_progress_independently() {
    let fleet = TestFleet::from_yaml(TWO_SERVICES).await;
    fleet.builds.set_outcome("svc-a-build", BuildOutcome::Hang).await;
    let handle = fleet.engine().start();

    let a = fleet.upload("svc-a/source.zip", b"a").await;
    let b = fleet.upload("svc-b/source.zip", b"b").await;
    assert_eq!(handle.dispatch(a).await, Dispatch::Started("svc-a".to_string()));
    assert_eq!(handle.dispatch(b).await, Dispatch::Started("svc-b".to_string()));

    let done = handle
        .wait_for_phase("svc-b", |phase| phase.is_terminal())
        .await
        .unwrap();
    assert_eq!(done, RunPhase::Succeeded);
    handle
        .wait_for_phase("svc-a", |phase| *phase == RunPhase::Building)
        .await
        .unwrap();
    assert_eq!(handle.phase("svc-a"), Some(RunPhase::Building));

    let svc_b = ServiceRef {
        cluster: "mimir-cluster".to_string(),
        service: "svc-b".to_string(),
    };
    let deployed = fleet.compute.service(&svc_b).await.unwrap();
    assert_eq!(deployed.desired_count, 2);
    assert!(deployed.image.is_some());

    assert!(handle.cancel("svc-a"));
    let runs = handle.shutdown().await;
    assert_eq!(runs["svc-a"][0].failure.as_ref().unwrap().kind, FailureKind::Cancelled);
    assert!(runs["svc-b"][0].succeeded());
}
