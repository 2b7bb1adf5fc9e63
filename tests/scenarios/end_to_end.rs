//! Test: a single upload flows through Source, Build and Deploy

use crate::helpers::*;
use mimir::collaborators::{BuildOutcome, ServiceRef};
use mimir::core::{ConfigError, FailureKind, FleetConfig, RunPhase};
use mimir::execution::Dispatch;

/// Uploading api/source.zip runs every stage and rolls the new image out
#[tokio::test]
async fn test_upload_deploys_new_image() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    let handle = fleet.engine().start();

    let event = fleet.upload("api/source.zip", b"api bundle").await;
    assert_eq!(handle.dispatch(event).await, Dispatch::Started("api".to_string()));

    let runs = handle.shutdown().await;
    let run = &runs["api"][0];
    assert_eq!(
        run.path(),
        vec![
            RunPhase::Idle,
            RunPhase::Sourcing,
            RunPhase::Building,
            RunPhase::Deploying,
            RunPhase::Succeeded
        ]
    );

    let image = run.image_ref.clone().unwrap();
    assert_eq!(image, format!("{}/mimir/api:build-1", REGISTRY_HOST));
    assert_eq!(fleet.registry.images("mimir/api").await, vec![image.clone()]);

    let service = ServiceRef {
        cluster: "mimir-cluster".to_string(),
        service: "api".to_string(),
    };
    let deployed = fleet.compute.service(&service).await.unwrap();
    assert_eq!(deployed.image.as_deref(), Some(image.as_str()));
    assert_eq!(deployed.revision, 1);
}

/// The build receives the bundle, its environment and a privileged runtime
#[tokio::test]
async fn test_build_receives_source_and_environment() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    let handle = fleet.engine().start();

    let event = fleet.upload("api/source.zip", b"api bundle").await;
    handle.dispatch(event).await;
    handle.shutdown().await;

    let started = fleet.builds.started().await;
    assert_eq!(started.len(), 1);
    let request = &started[0];
    assert_eq!(request.project, "api-build");
    assert_eq!(request.input.payload, b"api bundle");
    assert!(request.privileged);
    assert_eq!(request.environment["ECR_REGION"], "ap-northeast-2");
    assert_eq!(request.environment["ECR_REPO_NAME"], "mimir/api");
    assert_eq!(request.environment["GIT_PROJECT_NAME"], "api");
}

/// An upload for a service that is not configured starts nothing
#[tokio::test]
async fn test_upload_for_unknown_service_is_noop() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    let handle = fleet.engine().start();

    let event = fleet.upload("worker/source.zip", b"worker bundle").await;
    assert_eq!(handle.dispatch(event).await, Dispatch::Unmatched);

    let runs = handle.shutdown().await;
    assert!(runs["api"].is_empty());
    assert!(fleet.builds.started().await.is_empty());
    assert!(fleet.compute.updates().await.is_empty());
}

/// A failing build ends the run in Building and never touches the service
#[tokio::test]
async fn test_build_failure_skips_deploy() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    fleet
        .builds
        .set_outcome(
            "api-build",
            BuildOutcome::Fail {
                reason: "docker build exited with status 1".to_string(),
            },
        )
        .await;
    let handle = fleet.engine().start();

    let event = fleet.upload("api/source.zip", b"broken bundle").await;
    handle.dispatch(event).await;
    let runs = handle.shutdown().await;

    let run = &runs["api"][0];
    assert_eq!(run.phase, RunPhase::Failed);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, RunPhase::Building);
    assert_eq!(failure.kind, FailureKind::BuildFailure);
    assert_eq!(failure.cause, "docker build exited with status 1");
    assert_eq!(failure.log_ref.as_deref(), Some("logs/api-build:1"));

    assert!(fleet.compute.updates().await.is_empty());
    assert!(run.image_ref.is_none());
}

/// A duplicate service name rejects the whole file before anything is built
#[test]
fn test_duplicate_service_rejected() {
    let yaml = r#"
ecsServices:
  - name: api
    port: 8080
  - name: api
    port: 8081
"#;
    match FleetConfig::from_yaml(yaml) {
        Err(ConfigError::Validation(e)) => {
            assert_eq!(e.field, "name");
            assert!(e.entry.contains("api"));
        }
        other => panic!("Expected validation error, got {:?}", other),
    }
}

/// A fresh upload after a failure starts a new run from Idle
#[tokio::test]
async fn test_new_upload_after_failure_starts_fresh_run() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    fleet
        .builds
        .set_outcome("api-build", BuildOutcome::Fail { reason: "flaky".to_string() })
        .await;
    let handle = fleet.engine().start();

    let event = fleet.upload("api/source.zip", b"v1").await;
    handle.dispatch(event.clone()).await;
    handle
        .wait_for_phase("api", |phase| *phase == RunPhase::Failed)
        .await
        .unwrap();

    fleet.builds.set_outcome("api-build", BuildOutcome::Succeed).await;
    fleet.upload("api/source.zip", b"v2").await;
    // The worker may still be wrapping up the failed run
    let dispatch = handle.dispatch(event).await;
    assert!(matches!(dispatch, Dispatch::Started(_) | Dispatch::Queued(_)), "{:?}", dispatch);

    let runs = handle.shutdown().await;
    assert_eq!(runs["api"].len(), 2);
    assert_eq!(runs["api"][0].phase, RunPhase::Failed);
    assert!(runs["api"][1].succeeded());
    assert_eq!(runs["api"][1].path()[0], RunPhase::Idle);
    assert_ne!(runs["api"][0].run_id, runs["api"][1].run_id);
}
