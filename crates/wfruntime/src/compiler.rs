use std::collections::HashSet;
use wfcore::reference::malformed_references;
use wfcore::{
    CapabilityType, CompileError, CompileErrors, StepDefinition, StepOutputs, Value, WorkflowSpec,
};

/// Owner and name of the workflow being compiled
#[derive(Debug, Clone, Default)]
pub struct NewWorkflowParams {
    pub owner: String,
    pub name: String,
}

impl NewWorkflowParams {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

/// Collects steps into a [`WorkflowSpec`].
///
/// Problems found while adding steps are accumulated rather than raised, and
/// reported together by [`WorkflowSpecFactory::spec`].
#[derive(Debug)]
pub struct WorkflowSpecFactory {
    spec: WorkflowSpec,
    refs: HashSet<String>,
    /// Refs already reported as duplicated, so each is listed once
    duplicates: HashSet<String>,
    errors: Vec<CompileError>,
}

impl WorkflowSpecFactory {
    pub fn new(params: NewWorkflowParams) -> Self {
        Self {
            spec: WorkflowSpec::new(params.owner, params.name),
            refs: HashSet::new(),
            duplicates: HashSet::new(),
            errors: Vec::new(),
        }
    }

    /// Add a step and get a handle to its outputs for downstream steps
    pub fn add_step(&mut self, step: StepDefinition) -> StepOutputs {
        let outputs = StepOutputs::new(step.step_ref.clone());

        if step.capability_type != CapabilityType::Target {
            if step.step_ref.is_empty() {
                self.errors.push(CompileError::EmptyRef {
                    capability_id: step.id.clone(),
                });
            } else if !self.refs.insert(step.step_ref.clone())
                && self.duplicates.insert(step.step_ref.clone())
            {
                self.errors.push(CompileError::DuplicateRef(step.step_ref.clone()));
            }
        }

        let mut malformed = malformed_references(&step.inputs.to_value());
        malformed.extend(malformed_references(&Value::Object(step.config.clone())));
        for reference in malformed {
            self.errors.push(CompileError::MalformedReference {
                step_ref: step.step_ref.clone(),
                reference,
            });
        }

        match step.capability_type {
            CapabilityType::Trigger => self.spec.triggers.push(step),
            CapabilityType::Action => self.spec.actions.push(step),
            CapabilityType::Consensus => self.spec.consensus.push(step),
            CapabilityType::Target => self.spec.targets.push(step),
            CapabilityType::Combined => {
                tracing::debug!("Rejecting step '{}' with combined type", step.step_ref);
                self.errors.push(CompileError::UnknownCapabilityType {
                    step_ref: step.step_ref,
                    capability_type: CapabilityType::Combined,
                });
            }
        }

        outputs
    }

    /// The compiled spec, or every problem found while adding steps
    pub fn spec(&self) -> Result<WorkflowSpec, CompileErrors> {
        if self.errors.is_empty() {
            Ok(self.spec.clone())
        } else {
            Err(CompileErrors(self.errors.clone()))
        }
    }
}
