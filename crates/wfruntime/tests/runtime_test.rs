// crates/wfruntime/tests/runtime_test.rs

use std::sync::{Arc, Mutex};
use wfcaps::MockCapability;
use wfcore::{
    value_map, Capability, CapabilityError, CapabilityId, CapabilityType, ExecutionError,
    ModeError, RequestMetadata, Value, ValueMap,
};
use wfruntime::{CapabilityRegistry, ConsensusPolicy, DonRuntime, Mode, NodeRuntime};

const FETCH: &str = "fetch@1.0.0";

// Helper to build a runtime over a registry holding `capabilities`
async fn create_runtime(
    capabilities: Vec<Arc<MockCapability>>,
    participants: usize,
) -> DonRuntime {
    let registry = Arc::new(CapabilityRegistry::new());
    for capability in capabilities {
        registry.add(Capability::executable(capability)).await.unwrap();
    }
    let metadata = RequestMetadata {
        workflow_owner: "0x01".to_string(),
        workflow_name: "runtime".to_string(),
        workflow_execution_id: "exec-1".to_string(),
        reference_id: "step".to_string(),
    };
    DonRuntime::new(registry, metadata, participants)
}

fn fetch_mock() -> Arc<MockCapability> {
    Arc::new(MockCapability::action(
        CapabilityId::parse(FETCH).unwrap(),
        |request| Ok(request.inputs.clone()),
    ))
}

#[tokio::test]
async fn test_call_capability_in_don_mode() {
    let mock = fetch_mock();
    let runtime = create_runtime(vec![mock.clone()], 4).await;
    assert_eq!(runtime.mode(), Mode::Don);

    let promise = runtime.call_capability(FETCH, ValueMap::new(), value_map! { "x" => 1 });
    assert!(!promise.is_resolved());
    assert_eq!(promise.wait().await, Ok(value_map! { "x" => 1 }));
    assert_eq!(mock.call_count(), 1);

    let missing = runtime.call_capability("missing@1.0.0", ValueMap::new(), ValueMap::new());
    assert!(matches!(missing.wait().await, Err(ExecutionError::Resolution(_))));
}

#[tokio::test]
async fn test_capability_errors_carry_the_id() {
    let failing = Arc::new(MockCapability::failing(
        CapabilityId::parse(FETCH).unwrap(),
        CapabilityType::Action,
        "unreachable",
    ));
    let runtime = create_runtime(vec![failing], 1).await;

    let err = runtime
        .call_capability(FETCH, ValueMap::new(), ValueMap::new())
        .wait()
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ExecutionError::capability(
            FETCH,
            CapabilityError::ExecutionFailed("unreachable".to_string())
        )
    );
}

#[tokio::test]
async fn test_node_mode_calls_capability_per_participant() {
    let mock = fetch_mock();
    let runtime = create_runtime(vec![mock.clone()], 4).await;

    let consensus = runtime.run_in_node_mode(
        |node: NodeRuntime| async move {
            let outputs = node
                .call_capability(FETCH, ValueMap::new(), value_map! { "price" => 42 })
                .wait()
                .await?;
            Ok::<_, ExecutionError>(outputs.get("price").cloned().unwrap_or_default())
        },
        ConsensusPolicy::identical(),
    );

    assert_eq!(consensus.wait().await, Ok(Value::from(42)));
    assert_eq!(mock.call_count(), 4);
    assert_eq!(runtime.mode(), Mode::Don, "Node mode ends with the computation");
}

#[tokio::test]
async fn test_don_call_in_node_mode_is_rejected() {
    let mock = fetch_mock();
    let runtime = create_runtime(vec![mock.clone()], 3).await;

    let don = runtime.clone();
    let consensus = runtime.run_in_node_mode(
        move |_node| {
            let don = don.clone();
            async move {
                don.call_capability(FETCH, ValueMap::new(), ValueMap::new())
                    .wait()
                    .await
                    .map(Value::Object)
            }
        },
        ConsensusPolicy::identical().with_default(0),
    );

    // Mode errors are not folded into a default
    assert_eq!(
        consensus.wait().await,
        Err(ExecutionError::Mode(ModeError::DonModeCallInNodeMode))
    );
    assert_eq!(mock.call_count(), 0);
    assert_eq!(runtime.mode(), Mode::Don);
}

#[tokio::test]
async fn test_nested_node_mode_is_rejected() {
    let mock = fetch_mock();
    let runtime = create_runtime(vec![mock.clone()], 3).await;

    let don = runtime.clone();
    let consensus = runtime.run_in_node_mode(
        move |_node| {
            let don = don.clone();
            async move {
                don.run_in_node_mode(
                    |node: NodeRuntime| async move {
                        node.call_capability(FETCH, ValueMap::new(), ValueMap::new())
                            .wait()
                            .await
                            .map(Value::Object)
                    },
                    ConsensusPolicy::identical(),
                )
                .wait()
                .await
            }
        },
        ConsensusPolicy::identical().with_default(0),
    );

    assert_eq!(
        consensus.wait().await,
        Err(ExecutionError::Mode(ModeError::DonModeCallInNodeMode))
    );
    assert_eq!(mock.call_count(), 0);
    assert_eq!(runtime.mode(), Mode::Don);

    // The runtime is usable again once the outer computation ends
    let again = runtime.run_in_node_mode(
        |_node| async { Ok::<_, ExecutionError>(Value::from(1)) },
        ConsensusPolicy::identical(),
    );
    assert_eq!(again.wait().await, Ok(Value::from(1)));
}

#[tokio::test]
async fn test_node_call_in_don_mode_is_rejected() {
    let runtime = create_runtime(vec![fetch_mock()], 2).await;

    let escaped: Arc<Mutex<Option<NodeRuntime>>> = Arc::new(Mutex::new(None));
    let slot = escaped.clone();
    runtime
        .run_in_node_mode(
            move |node| {
                *slot.lock().unwrap() = Some(node);
                async { Ok::<_, ExecutionError>(Value::from("ok")) }
            },
            ConsensusPolicy::identical(),
        )
        .wait()
        .await
        .unwrap();

    let node = escaped.lock().unwrap().take().unwrap();
    let err = node
        .call_capability(FETCH, ValueMap::new(), ValueMap::new())
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err, ExecutionError::Mode(ModeError::NodeModeCallInDonMode));
}

#[tokio::test]
async fn test_identical_needs_a_majority() {
    let runtime = create_runtime(vec![], 4).await;

    // Three of four agree
    let agreed = runtime.run_in_node_mode(
        |node| async move {
            let vote = if node.participant() == 3 { "b" } else { "a" };
            Ok::<_, ExecutionError>(Value::from(vote))
        },
        ConsensusPolicy::identical(),
    );
    assert_eq!(agreed.wait().await, Ok(Value::from("a")));

    // Two of four is not a strict majority
    let split = runtime.run_in_node_mode(
        |node| async move { Ok::<_, ExecutionError>(Value::from((node.participant() % 2) as i64)) },
        ConsensusPolicy::identical(),
    );
    assert!(matches!(
        split.wait().await,
        Err(ExecutionError::NoConsensus { policy: "identical", .. })
    ));

    let defaulted = runtime.run_in_node_mode(
        |node| async move { Ok::<_, ExecutionError>(Value::from((node.participant() % 2) as i64)) },
        ConsensusPolicy::identical().with_default("fallback"),
    );
    assert_eq!(defaulted.wait().await, Ok(Value::from("fallback")));
}

#[tokio::test]
async fn test_failed_participants_become_error_observations() {
    let runtime = create_runtime(vec![], 5).await;

    let consensus = runtime.run_in_node_mode(
        |node| async move {
            if node.participant() == 0 {
                Err(ExecutionError::capability(
                    FETCH,
                    CapabilityError::ExecutionFailed("timeout".to_string()),
                ))
            } else {
                let price = 10 * node.participant() as i64;
                Ok::<Value, ExecutionError>(value_map! { "price" => price, "volume" => 7 }.into())
            }
        },
        ConsensusPolicy::median_of_fields(),
    );

    // Prices 10, 20, 30, 40; lower median
    assert_eq!(
        consensus.wait().await,
        Ok(Value::Object(value_map! { "price" => 20, "volume" => 7 }))
    );
}
