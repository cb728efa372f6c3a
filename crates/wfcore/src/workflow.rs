use crate::{CapabilityType, OutputRef, Template, Value, ValueMap};
use serde::{Deserialize, Serialize};

/// Inputs of a step: either one upstream output, or a named mapping of literals and references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepInputs {
    OutputRef(String),
    Mapping(ValueMap),
}

impl Default for StepInputs {
    fn default() -> Self {
        StepInputs::Mapping(ValueMap::new())
    }
}

impl StepInputs {
    /// The inputs as a value tree, for templating and validation
    pub fn to_value(&self) -> Value {
        match self {
            StepInputs::OutputRef(r) => Value::String(r.clone()),
            StepInputs::Mapping(map) => Value::Object(map.clone()),
        }
    }

    pub fn template(&self) -> Template {
        match self {
            StepInputs::OutputRef(r) => Template::compile(&Value::String(r.clone())),
            StepInputs::Mapping(map) => Template::compile_map(map),
        }
    }
}

/// One capability invocation inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(rename = "ref")]
    pub step_ref: String,
    #[serde(default)]
    pub inputs: StepInputs,
    #[serde(default)]
    pub config: ValueMap,
    #[serde(rename = "type")]
    pub capability_type: CapabilityType,
}

impl StepDefinition {
    pub fn new(
        id: impl Into<String>,
        step_ref: impl Into<String>,
        capability_type: CapabilityType,
    ) -> Self {
        Self {
            id: id.into(),
            step_ref: step_ref.into(),
            inputs: StepInputs::default(),
            config: ValueMap::new(),
            capability_type,
        }
    }

    pub fn trigger(id: impl Into<String>, step_ref: impl Into<String>) -> Self {
        Self::new(id, step_ref, CapabilityType::Trigger)
    }

    pub fn action(id: impl Into<String>, step_ref: impl Into<String>) -> Self {
        Self::new(id, step_ref, CapabilityType::Action)
    }

    pub fn consensus(id: impl Into<String>, step_ref: impl Into<String>) -> Self {
        Self::new(id, step_ref, CapabilityType::Consensus)
    }

    pub fn target(id: impl Into<String>, step_ref: impl Into<String>) -> Self {
        Self::new(id, step_ref, CapabilityType::Target)
    }

    /// Take all inputs from one upstream output
    pub fn with_inputs_from(mut self, reference: impl Into<String>) -> Self {
        self.inputs = StepInputs::OutputRef(reference.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        match &mut self.inputs {
            StepInputs::Mapping(map) => {
                map.insert(name.into(), value.into());
            }
            StepInputs::OutputRef(_) => {
                let mut map = ValueMap::new();
                map.insert(name.into(), value.into());
                self.inputs = StepInputs::Mapping(map);
            }
        }
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Handle to a step's outputs, embedded by downstream steps in their inputs or config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutputs {
    reference: OutputRef,
}

impl StepOutputs {
    pub fn new(step_ref: impl Into<String>) -> Self {
        Self {
            reference: OutputRef::new(step_ref),
        }
    }

    pub fn step_ref(&self) -> &str {
        &self.reference.step_ref
    }

    pub fn field(&self, name: impl Into<String>) -> Self {
        Self {
            reference: self.reference.field(name),
        }
    }

    pub fn reference(&self) -> String {
        self.reference.to_string()
    }
}

impl std::fmt::Display for StepOutputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.reference.fmt(f)
    }
}

impl From<StepOutputs> for Value {
    fn from(outputs: StepOutputs) -> Self {
        Value::String(outputs.reference())
    }
}

impl From<StepOutputs> for String {
    fn from(outputs: StepOutputs) -> Self {
        outputs.reference()
    }
}

/// Compiled workflow: steps grouped by capability type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub owner: String,
    pub name: String,
    pub triggers: Vec<StepDefinition>,
    pub actions: Vec<StepDefinition>,
    pub consensus: Vec<StepDefinition>,
    pub targets: Vec<StepDefinition>,
}

impl WorkflowSpec {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// All steps, triggers first and targets last
    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.triggers
            .iter()
            .chain(&self.actions)
            .chain(&self.consensus)
            .chain(&self.targets)
    }

    pub fn step_count(&self) -> usize {
        self.triggers.len() + self.actions.len() + self.consensus.len() + self.targets.len()
    }

    pub fn find_step(&self, step_ref: &str) -> Option<&StepDefinition> {
        self.steps().find(|s| s.step_ref == step_ref)
    }
}
