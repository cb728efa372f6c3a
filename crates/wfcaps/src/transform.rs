use async_trait::async_trait;
use wfcore::{
    BaseCapability, CapabilityError, CapabilityId, CapabilityInfo, CapabilityRequest,
    CapabilityType, ExecutableCapability, Value, ValueMap,
};

/// Action that returns its inputs as outputs.
///
/// A `defaults` object in the config fills in outputs missing from the inputs.
pub struct PassthroughAction {
    id: CapabilityId,
}

impl Default for PassthroughAction {
    fn default() -> Self {
        Self {
            id: CapabilityId::new("passthrough", 1, 0, 0),
        }
    }
}

impl BaseCapability for PassthroughAction {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo::new(
            self.id.clone(),
            CapabilityType::Action,
            "Pass inputs through as outputs",
        )
    }
}

#[async_trait]
impl ExecutableCapability for PassthroughAction {
    async fn execute(&self, request: CapabilityRequest) -> Result<ValueMap, CapabilityError> {
        let mut outputs = request.inputs;

        match request.config.get("defaults") {
            Some(Value::Object(defaults)) => {
                for (key, value) in defaults {
                    outputs.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            Some(other) => {
                return Err(CapabilityError::Configuration(format!(
                    "'defaults' must be an object, got {}",
                    other.kind()
                )))
            }
            None => {}
        }

        Ok(outputs)
    }
}
