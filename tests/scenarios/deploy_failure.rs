//! Test: failed or stuck rollouts end the run in Deploying

use crate::helpers::*;
use mimir::collaborators::{RolloutOutcome, ServiceRef};
use mimir::core::{FailureKind, RunPhase};
use std::time::Duration;

fn api_service() -> ServiceRef {
    ServiceRef {
        cluster: "mimir-cluster".to_string(),
        service: "api".to_string(),
    }
}

/// A rollout that never stabilizes leaves the old image in place
#[tokio::test]
async fn test_failed_rollout_keeps_previous_image() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    fleet
        .compute
        .set_outcome(RolloutOutcome::Fail {
            reason: "tasks failed health checks".to_string(),
        })
        .await;
    let handle = fleet.engine().start();

    let event = fleet.upload("api/source.zip", b"bundle").await;
    handle.dispatch(event).await;
    let runs = handle.shutdown().await;

    let run = &runs["api"][0];
    assert_eq!(run.phase, RunPhase::Failed);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, RunPhase::Deploying);
    assert_eq!(failure.kind, FailureKind::DeployFailure);
    assert_eq!(failure.cause, "tasks failed health checks");

    // The build itself succeeded and pushed an image
    assert_eq!(fleet.registry.images("mimir/api").await.len(), 1);
    assert_eq!(fleet.compute.updates().await.len(), 1);

    let deployed = fleet.compute.service(&api_service()).await.unwrap();
    assert!(deployed.image.is_none());
    assert_eq!(deployed.revision, 0);
}

/// A rollout still in progress at the deadline fails the run
#[tokio::test]
async fn test_rollout_timeout() {
    let mut fleet = TestFleet::from_yaml(API_ONLY).await;
    fleet.policy.rollout_timeout = Duration::from_millis(50);
    fleet.compute.set_outcome(RolloutOutcome::Hang).await;
    let handle = fleet.engine().start();

    let event = fleet.upload("api/source.zip", b"bundle").await;
    handle.dispatch(event).await;
    let runs = handle.shutdown().await;

    let failure = runs["api"][0].failure.as_ref().unwrap();
    assert_eq!(failure.stage, RunPhase::Deploying);
    assert_eq!(failure.kind, FailureKind::DeployFailure);
    assert!(failure.cause.contains("did not stabilize"), "{}", failure.cause);

    let deployed = fleet.compute.service(&api_service()).await.unwrap();
    assert!(deployed.image.is_none());
}

/// A later successful run deploys over a failed rollout
#[tokio::test]
async fn test_recovery_after_failed_rollout() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    fleet
        .compute
        .set_outcome(RolloutOutcome::Fail {
            reason: "crash loop".to_string(),
        })
        .await;
    let handle = fleet.engine().start();

    let event = fleet.upload("api/source.zip", b"v1").await;
    handle.dispatch(event.clone()).await;
    handle
        .wait_for_phase("api", |phase| *phase == RunPhase::Failed)
        .await
        .unwrap();

    fleet.compute.set_outcome(RolloutOutcome::Stabilize).await;
    fleet.upload("api/source.zip", b"v2").await;
    handle.dispatch(event).await;
    let runs = handle.shutdown().await;

    assert_eq!(runs["api"].len(), 2);
    assert!(runs["api"][1].succeeded());
    let deployed = fleet.compute.service(&api_service()).await.unwrap();
    assert_eq!(deployed.image.as_deref(), Some("registry.test/mimir/api:build-2"));
    assert_eq!(deployed.revision, 1);
}
