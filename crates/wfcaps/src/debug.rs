use async_trait::async_trait;
use parking_lot::Mutex;
use wfcore::{
    BaseCapability, CapabilityError, CapabilityId, CapabilityInfo, CapabilityRequest,
    CapabilityType, ExecutableCapability, ValueMap,
};

/// Target that logs the inputs it is given
pub struct LogTarget {
    id: CapabilityId,
    writes: Mutex<Vec<ValueMap>>,
}

impl LogTarget {
    /// Inputs of every write so far, oldest first
    pub fn writes(&self) -> Vec<ValueMap> {
        self.writes.lock().clone()
    }
}

impl Default for LogTarget {
    fn default() -> Self {
        Self {
            id: CapabilityId::new("log-target", 1, 0, 0),
            writes: Mutex::new(Vec::new()),
        }
    }
}

impl BaseCapability for LogTarget {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo::new(
            self.id.clone(),
            CapabilityType::Target,
            "Logs its inputs",
        )
    }
}

#[async_trait]
impl ExecutableCapability for LogTarget {
    async fn execute(&self, request: CapabilityRequest) -> Result<ValueMap, CapabilityError> {
        tracing::info!(
            "{} ({}):",
            request.metadata.reference_id,
            request.metadata.workflow_name
        );
        let mut keys: Vec<&String> = request.inputs.keys().collect();
        keys.sort();
        for key in keys {
            tracing::info!("  {}: {:?}", key, request.inputs[key]);
        }

        self.writes.lock().push(request.inputs);
        Ok(ValueMap::new())
    }
}
