// crates/wfcaps/tests/capabilities_test.rs

use std::collections::HashMap;
use wfcaps::{standard_capabilities, LogTarget, MockCapability, PassthroughAction};
use wfcore::{
    CapabilityError, CapabilityId, CapabilityRequest, CapabilityType, ExecutableCapability,
    RequestMetadata, Value, ValueMap,
};

// Helper function to create a request on behalf of a step
fn create_request(step_ref: &str, inputs: ValueMap) -> CapabilityRequest {
    CapabilityRequest {
        metadata: RequestMetadata {
            workflow_owner: "0x01".to_string(),
            workflow_name: "test".to_string(),
            workflow_execution_id: "exec-1".to_string(),
            reference_id: step_ref.to_string(),
        },
        config: HashMap::new(),
        inputs,
    }
}

#[test]
fn test_standard_capabilities_declare_matching_types() {
    let capabilities = standard_capabilities();
    let ids: Vec<String> = capabilities.iter().map(|c| c.info().id.to_string()).collect();

    assert_eq!(
        ids,
        vec!["static-trigger@1.0.0", "passthrough@1.0.0", "log-target@1.0.0"]
    );
    assert!(
        capabilities.iter().all(|c| c.matches_declared_type()),
        "Every standard capability should implement its declared type"
    );
}

#[tokio::test]
async fn test_passthrough_returns_inputs() {
    let mut inputs = HashMap::new();
    inputs.insert("in".to_string(), Value::from("cool"));

    let outputs = PassthroughAction::default()
        .execute(create_request("action", inputs.clone()))
        .await
        .unwrap();

    assert_eq!(outputs, inputs);
}

#[tokio::test]
async fn test_log_target_records_writes() {
    let target = LogTarget::default();
    let mut inputs = HashMap::new();
    inputs.insert("done".to_string(), Value::from(true));

    let outputs = target
        .execute(create_request("write", inputs.clone()))
        .await
        .unwrap();

    assert!(outputs.is_empty(), "Targets produce no outputs");
    assert_eq!(target.writes(), vec![inputs]);
}

#[tokio::test]
async fn test_mock_records_calls_per_step() {
    let id = CapabilityId::parse("mock-action@1.0.0").unwrap();
    let mock = MockCapability::action(id, |request| {
        let mut outputs = HashMap::new();
        outputs.insert(
            "seen".to_string(),
            Value::from(request.inputs.len() as i64),
        );
        Ok(outputs)
    });

    mock.execute(create_request("a", HashMap::new())).await.unwrap();
    mock.execute(create_request("b", HashMap::new())).await.unwrap();
    mock.execute(create_request("a", HashMap::new())).await.unwrap();

    assert_eq!(mock.call_count(), 3);
    assert_eq!(mock.calls_for("a").len(), 2);
    assert_eq!(mock.calls_for("b").len(), 1);
    assert!(mock.calls_for("c").is_empty());
}

#[tokio::test]
async fn test_failing_mock_still_records_call() {
    let id = CapabilityId::parse("broken@2.0.0").unwrap();
    let mock = MockCapability::failing(id, CapabilityType::Target, "boom");

    let err = mock
        .execute(create_request("write", HashMap::new()))
        .await
        .unwrap_err();

    assert_eq!(err, CapabilityError::ExecutionFailed("boom".to_string()));
    assert_eq!(mock.call_count(), 1);
}
