// crates/wfruntime/tests/registry_test.rs

use std::sync::Arc;
use std::time::Duration;
use wfcaps::{ManualTrigger, MockCapability};
use wfcore::{
    value_map, Capability, CapabilityId, CapabilityType, RegistryError, ResolutionError,
    TriggerRegistrationRequest, ValueMap,
};
use wfruntime::CapabilityRegistry;

fn id(raw: &str) -> CapabilityId {
    CapabilityId::parse(raw).unwrap()
}

fn action(raw: &str) -> Arc<MockCapability> {
    Arc::new(MockCapability::returning(
        id(raw),
        CapabilityType::Action,
        ValueMap::new(),
    ))
}

fn registration(trigger_id: &str) -> TriggerRegistrationRequest {
    TriggerRegistrationRequest {
        trigger_id: trigger_id.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_add_and_get_exact() {
    let registry = CapabilityRegistry::new();
    let capability = Capability::executable(action("mock-action@1.0.0"));
    registry.add(capability.clone()).await.unwrap();

    let found = registry.get("mock-action@1.0.0").await.unwrap();
    assert!(found.same_instance(&capability));
    assert_eq!(registry.list().await.len(), 1);
}

#[tokio::test]
async fn test_add_duplicate_fails() {
    let registry = CapabilityRegistry::new();
    registry
        .add(Capability::executable(action("mock-action@1.0.0")))
        .await
        .unwrap();

    let err = registry
        .add(Capability::executable(action("mock-action@1.0.0")))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyExists(ref id) if id == "mock-action@1.0.0"));
}

#[tokio::test]
async fn test_declared_type_must_match_implementation() {
    let registry = CapabilityRegistry::new();
    let mislabeled = MockCapability::returning(
        id("not-a-trigger@1.0.0"),
        CapabilityType::Trigger,
        ValueMap::new(),
    );

    let err = registry
        .add(Capability::executable(Arc::new(mislabeled)))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::TypeMismatch { .. }));
    assert!(registry.list().await.is_empty());
}

#[tokio::test]
async fn test_resolves_highest_compatible_version() {
    let registry = CapabilityRegistry::new();
    let v1_0 = Capability::executable(action("fetch@1.0.0"));
    let v1_2 = Capability::executable(action("fetch@1.2.0"));
    let v2_0 = Capability::executable(action("fetch@2.0.0"));
    for capability in [&v1_0, &v1_2, &v2_0] {
        registry.add(capability.clone()).await.unwrap();
    }

    // Exact match wins
    let exact = registry.get("fetch@1.0.0").await.unwrap();
    assert!(exact.same_instance(&v1_0));

    // Same major, newer minor
    let newer = registry.get("fetch@1.1.0").await.unwrap();
    assert!(newer.same_instance(&v1_2));

    // Never across majors
    let err = registry.get("fetch@1.3.0").await.unwrap_err();
    assert_eq!(err, ResolutionError::NotFound("fetch@1.3.0".to_string()));
    let err = registry.get("fetch@3.0.0").await.unwrap_err();
    assert!(matches!(err, ResolutionError::NotFound(_)));
}

#[tokio::test]
async fn test_prerelease_requires_same_tag() {
    let registry = CapabilityRegistry::new();
    registry
        .add(Capability::executable(action("fetch@1.0.0-beta")))
        .await
        .unwrap();

    assert!(registry.get("fetch@1.0.0-beta").await.is_ok());
    assert!(registry.get("fetch@1.0.0").await.is_err());
    assert!(registry.get("fetch@1.0.0-alpha").await.is_err());
}

#[tokio::test]
async fn test_invalid_ids_are_rejected() {
    let registry = CapabilityRegistry::new();

    for raw in ["fetch", "@1.0.0", "fetch@one"] {
        let err = registry.get(raw).await.unwrap_err();
        assert!(
            matches!(err, ResolutionError::InvalidId(_)),
            "'{}' should not parse, got {:?}",
            raw,
            err
        );
    }
}

#[tokio::test]
async fn test_kind_mismatch() {
    let registry = CapabilityRegistry::new();
    registry
        .add(Capability::executable(action("mock-action@1.0.0")))
        .await
        .unwrap();

    let err = registry.get_trigger("mock-action@1.0.0").await.err().unwrap();
    assert!(matches!(err, ResolutionError::KindMismatch { expected: "trigger", .. }));
    assert!(registry.get_executable("mock-action@1.0.0").await.is_ok());
}

#[tokio::test]
async fn test_remove_and_replace() {
    let registry = CapabilityRegistry::new();
    let err = registry.remove("mock-action@1.0.0").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));

    let first = Capability::executable(action("mock-action@1.0.0"));
    let second = Capability::executable(action("mock-action@1.0.0"));
    registry.add(first.clone()).await.unwrap();

    registry.replace(second.clone()).await.unwrap();
    let found = registry.get("mock-action@1.0.0").await.unwrap();
    assert!(found.same_instance(&second));
    assert!(!found.same_instance(&first));

    registry.remove("mock-action@1.0.0").await.unwrap();
    assert!(registry.get("mock-action@1.0.0").await.is_err());
}

#[tokio::test]
async fn test_trigger_registrations_replay_after_hot_swap() {
    let registry = CapabilityRegistry::new();
    let trigger_id = "manual-trigger@1.0.0";

    let original = Arc::new(ManualTrigger::default());
    registry
        .add(Capability::trigger(original.clone()))
        .await
        .unwrap();

    let mut first = registry
        .register_trigger(trigger_id, registration("reg-1"))
        .await
        .unwrap();
    let mut second = registry
        .register_trigger(trigger_id, registration("reg-2"))
        .await
        .unwrap();
    assert_eq!(registry.registration_count(trigger_id).await, 2);

    assert!(original.fire_to("reg-1", value_map! { "n" => 1 }));
    let event = first.recv().await.unwrap();
    assert_eq!(event.outputs, value_map! { "n" => 1 });

    // Removing keeps the remembered registrations around for a successor
    registry.remove(trigger_id).await.unwrap();
    assert_eq!(registry.registration_count(trigger_id).await, 2);

    let successor = Arc::new(ManualTrigger::default().rejecting("reg-2"));
    let err = registry
        .add(Capability::trigger(successor.clone()))
        .await
        .unwrap_err();
    match err {
        RegistryError::PartialReplayFailure { id, failed } => {
            assert_eq!(id, trigger_id);
            assert_eq!(failed, vec!["reg-2".to_string()]);
        }
        other => panic!("Expected a partial replay failure, got {:?}", other),
    }

    // The successor is registered anyway and serves the surviving subscriber
    assert!(registry.get(trigger_id).await.is_ok());
    assert_eq!(registry.registration_count(trigger_id).await, 1);
    assert_eq!(successor.registration_count(), 1);

    assert!(successor.fire_to("reg-1", value_map! { "n" => 2 }));
    let event = tokio::time::timeout(Duration::from_secs(1), first.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.outputs, value_map! { "n" => 2 });

    // The dropped registration's channel is closed
    let closed = tokio::time::timeout(Duration::from_secs(1), second.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_unregister_unknown_registration() {
    let registry = CapabilityRegistry::new();
    registry
        .add(Capability::trigger(Arc::new(ManualTrigger::default())))
        .await
        .unwrap();

    let _events = registry
        .register_trigger("manual-trigger@1.0.0", registration("reg-1"))
        .await
        .unwrap();
    registry
        .unregister_trigger("manual-trigger@1.0.0", registration("reg-1"))
        .await
        .unwrap();
    assert_eq!(registry.registration_count("manual-trigger@1.0.0").await, 0);

    assert!(registry
        .unregister_trigger("manual-trigger@1.0.0", registration("reg-1"))
        .await
        .is_err());
}
