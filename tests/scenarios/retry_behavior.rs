//! Test: source fetches retry a bounded number of times

use crate::helpers::*;
use mimir::core::{FailureKind, ObjectCreatedEvent, RunPhase};
use mimir::execution::ExecutionEvent;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// A notification for an object that never appears fails the run in Sourcing
#[tokio::test]
async fn test_missing_source_fails_after_max_attempts() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    let handle = fleet.engine().start();

    handle.dispatch(ObjectCreatedEvent::new(BUCKET, "api/source.zip")).await;
    let runs = handle.shutdown().await;

    let run = &runs["api"][0];
    assert_eq!(run.path(), vec![RunPhase::Idle, RunPhase::Sourcing, RunPhase::Failed]);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, RunPhase::Sourcing);
    assert_eq!(failure.kind, FailureKind::SourceUnavailable);
    assert!(failure.cause.contains("after 3 attempts"), "{}", failure.cause);

    assert_eq!(fleet.store.get_calls(), 3);
    assert!(fleet.builds.started().await.is_empty());
}

/// An object that becomes readable within the retry budget is picked up
#[tokio::test]
async fn test_eventually_visible_source_succeeds() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    fleet
        .store
        .put_eventually("api/source.zip", b"late bundle".to_vec(), 2)
        .await;
    let handle = fleet.engine().start();

    handle.dispatch(ObjectCreatedEvent::new(BUCKET, "api/source.zip")).await;
    let runs = handle.shutdown().await;

    assert!(runs["api"][0].succeeded());
    assert_eq!(fleet.store.get_calls(), 3);
    assert_eq!(fleet.builds.started().await[0].input.payload, b"late bundle");
}

/// Every retried attempt is reported before the next one is made
#[tokio::test]
async fn test_retries_are_reported() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    fleet
        .store
        .put_eventually("api/source.zip", b"bundle".to_vec(), 2)
        .await;

    let retries = Arc::new(AtomicU32::new(0));
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let mut engine = fleet.engine();
    {
        let retries = retries.clone();
        let attempts = attempts.clone();
        engine.add_event_handler(move |event| {
            if let ExecutionEvent::SourceRetrying {
                attempt, max_attempts, ..
            } = event
            {
                retries.fetch_add(1, Ordering::SeqCst);
                attempts.lock().unwrap().push((attempt, max_attempts));
            }
        });
    }

    let handle = engine.start();
    handle.dispatch(ObjectCreatedEvent::new(BUCKET, "api/source.zip")).await;
    handle.shutdown().await;

    assert_eq!(retries.load(Ordering::SeqCst), 2);
    assert_eq!(*attempts.lock().unwrap(), vec![(1, 3), (2, 3)]);
}

/// A single attempt budget fails on the first miss
#[tokio::test]
async fn test_single_attempt_budget() {
    let mut fleet = TestFleet::from_yaml(API_ONLY).await;
    fleet.policy.source_retry.max_attempts = 1;
    fleet
        .store
        .put_eventually("api/source.zip", b"bundle".to_vec(), 1)
        .await;
    let handle = fleet.engine().start();

    handle.dispatch(ObjectCreatedEvent::new(BUCKET, "api/source.zip")).await;
    let runs = handle.shutdown().await;

    assert_eq!(runs["api"][0].failure.as_ref().unwrap().kind, FailureKind::SourceUnavailable);
    assert_eq!(fleet.store.get_calls(), 1);
}
