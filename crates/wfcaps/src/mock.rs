use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use wfcore::{
    BaseCapability, CapabilityError, CapabilityId, CapabilityInfo, CapabilityRequest,
    CapabilityType, ExecutableCapability, ValueMap,
};

type Handler = Arc<dyn Fn(&CapabilityRequest) -> Result<ValueMap, CapabilityError> + Send + Sync>;

/// Executable capability backed by a closure, recording every request it sees.
///
/// Serves as an action, consensus or target depending on the declared type.
pub struct MockCapability {
    info: CapabilityInfo,
    handler: Handler,
    calls: Mutex<Vec<CapabilityRequest>>,
}

impl MockCapability {
    pub fn new<F>(id: CapabilityId, capability_type: CapabilityType, handler: F) -> Self
    where
        F: Fn(&CapabilityRequest) -> Result<ValueMap, CapabilityError> + Send + Sync + 'static,
    {
        Self {
            info: CapabilityInfo::new(id, capability_type, "Mock capability"),
            handler: Arc::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn action<F>(id: CapabilityId, handler: F) -> Self
    where
        F: Fn(&CapabilityRequest) -> Result<ValueMap, CapabilityError> + Send + Sync + 'static,
    {
        Self::new(id, CapabilityType::Action, handler)
    }

    pub fn consensus<F>(id: CapabilityId, handler: F) -> Self
    where
        F: Fn(&CapabilityRequest) -> Result<ValueMap, CapabilityError> + Send + Sync + 'static,
    {
        Self::new(id, CapabilityType::Consensus, handler)
    }

    pub fn target<F>(id: CapabilityId, handler: F) -> Self
    where
        F: Fn(&CapabilityRequest) -> Result<ValueMap, CapabilityError> + Send + Sync + 'static,
    {
        Self::new(id, CapabilityType::Target, handler)
    }

    /// Always return `outputs`
    pub fn returning(id: CapabilityId, capability_type: CapabilityType, outputs: ValueMap) -> Self {
        Self::new(id, capability_type, move |_| Ok(outputs.clone()))
    }

    /// Always fail with `message`
    pub fn failing(id: CapabilityId, capability_type: CapabilityType, message: &str) -> Self {
        let message = message.to_string();
        Self::new(id, capability_type, move |_| {
            Err(CapabilityError::ExecutionFailed(message.clone()))
        })
    }

    pub fn calls(&self) -> Vec<CapabilityRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Requests made on behalf of the step `step_ref`
    pub fn calls_for(&self, step_ref: &str) -> Vec<CapabilityRequest> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.metadata.reference_id == step_ref)
            .cloned()
            .collect()
    }
}

impl BaseCapability for MockCapability {
    fn info(&self) -> CapabilityInfo {
        self.info.clone()
    }
}

#[async_trait]
impl ExecutableCapability for MockCapability {
    async fn execute(&self, request: CapabilityRequest) -> Result<ValueMap, CapabilityError> {
        let result = (self.handler)(&request);
        self.calls.lock().push(request);
        result
    }
}
