//! Test: services never reach each other's pipelines or resources

use crate::helpers::*;
use mimir::core::naming::ResourceNames;
use mimir::core::{Action, Resource};
use mimir::execution::Dispatch;

fn resources_of(names: &ResourceNames) -> Vec<Resource> {
    vec![
        Resource::Object {
            bucket: names.bucket.clone(),
            key: names.source_key.clone(),
        },
        Resource::Repository(names.repository.clone()),
        Resource::BuildProject(names.build_project.clone()),
        Resource::ComputeService {
            cluster: names.cluster.clone(),
            service: names.compute_service.clone(),
        },
    ]
}

const ACTIONS: [Action; 9] = [
    Action::ObjectGet,
    Action::ObjectPut,
    Action::RegistryPull,
    Action::RegistryPush,
    Action::BuildStart,
    Action::BuildPoll,
    Action::BuildStop,
    Action::ServiceUpdate,
    Action::ServiceDescribe,
];

/// svc-a's upload starts only svc-a's pipeline
#[tokio::test]
async fn test_upload_starts_only_owning_pipeline() {
    let fleet = TestFleet::from_yaml(TWO_SERVICES).await;
    let handle = fleet.engine().start();

    let event = fleet.upload("svc-a/source.zip", b"a").await;
    assert_eq!(handle.dispatch(event).await, Dispatch::Started("svc-a".to_string()));

    let runs = handle.shutdown().await;
    assert_eq!(runs["svc-a"].len(), 1);
    assert!(runs["svc-b"].is_empty());

    let started = fleet.builds.started().await;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].project, "svc-a-build");
}

/// No identity of one service is permitted anything on another's resources
#[tokio::test]
async fn test_no_grant_crosses_services() {
    let fleet = TestFleet::from_yaml(TWO_SERVICES).await;

    for owner in &fleet.topology.pipelines {
        for other in fleet.topology.pipelines.iter().filter(|p| p.service != owner.service) {
            for identity in owner.identities.iter() {
                for resource in resources_of(&other.names) {
                    for action in ACTIONS {
                        assert!(
                            !identity.permits(action, &resource),
                            "{} may {} on {}",
                            identity.name,
                            action,
                            resource
                        );
                    }
                }
            }
        }
    }
}

/// Each stage holds only the permissions its step needs
#[tokio::test]
async fn test_stage_identities_are_minimal() {
    let fleet = TestFleet::from_yaml(API_ONLY).await;
    let pipeline = fleet.topology.pipeline("api").unwrap();
    let own = resources_of(&pipeline.names);
    let source_object = &own[0];

    let source = &pipeline.identities.source;
    assert!(source.permits(Action::ObjectGet, source_object));
    assert!(!source.permits(Action::ObjectPut, source_object));

    let build = &pipeline.identities.build;
    assert!(build.permits(Action::ObjectPut, source_object));
    assert!(build.permits(Action::RegistryPush, &own[1]));
    assert!(build.permits(Action::RegistryAuthToken, &Resource::Account));
    assert!(!build.permits(Action::ServiceUpdate, &own[3]));

    let deploy = &pipeline.identities.deploy;
    assert!(deploy.permits(Action::ServiceUpdate, &own[3]));
    assert!(!deploy.permits(Action::ObjectGet, source_object));
    assert!(!deploy.permits(Action::RegistryPush, &own[1]));
}

/// An upload under another service's namespace never reaches this pipeline
#[tokio::test]
async fn test_nested_key_under_other_namespace_is_unmatched() {
    let fleet = TestFleet::from_yaml(TWO_SERVICES).await;
    let handle = fleet.engine().start();

    let event = fleet.upload("svc-b/svc-a/source.zip", b"sneaky").await;
    assert_eq!(handle.dispatch(event).await, Dispatch::Unmatched);

    let runs = handle.shutdown().await;
    assert!(runs.values().all(|records| records.is_empty()));
}
