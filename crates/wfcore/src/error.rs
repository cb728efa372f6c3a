use crate::CapabilityType;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Compile error: {0}")]
    Compile(#[from] CompileErrors),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by capability implementations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Trigger registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Unknown trigger registration: {0}")]
    UnknownRegistration(String),
}

/// A single problem found while compiling a workflow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("step for capability {capability_id} has an empty ref")]
    EmptyRef { capability_id: String },

    #[error("duplicate step ref '{0}'")]
    DuplicateRef(String),

    #[error("step '{step_ref}' has unsupported capability type {capability_type}")]
    UnknownCapabilityType {
        step_ref: String,
        capability_type: CapabilityType,
    },

    #[error("step '{step_ref}' has malformed reference '{reference}'")]
    MalformedReference { step_ref: String, reference: String },
}

/// Every problem accumulated by a compiler, reported together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    pub fn errors(&self) -> &[CompileError] {
        &self.0
    }

    /// Refs reported as duplicated, in the order they were found
    pub fn duplicated_refs(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter_map(|e| match e {
                CompileError::DuplicateRef(r) => Some(r.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} problem(s) in workflow spec", self.0.len())?;
        for error in &self.0 {
            write!(f, "; {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Capability already exists: {0}")]
    AlreadyExists(String),

    #[error("Capability {id} declares type {declared} but implements {implemented}")]
    TypeMismatch {
        id: String,
        declared: CapabilityType,
        implemented: &'static str,
    },

    #[error("Capability not found: {0}")]
    NotFound(String),

    #[error("Invalid capability id: {0}")]
    InvalidId(#[from] IdError),

    #[error("Trigger {id} registered, but {} registration(s) could not be replayed: {}", .failed.len(), .failed.join(", "))]
    PartialReplayFailure { id: String, failed: Vec<String> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Invalid capability id: {0}")]
    InvalidId(#[from] IdError),

    #[error("No registered capability compatible with {0}")]
    NotFound(String),

    #[error("Capability {id} is not a {expected} capability")]
    KindMismatch { id: String, expected: &'static str },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("'{0}' is missing the '@' version separator")]
    MissingVersion(String),

    #[error("'{0}' has an empty name")]
    EmptyName(String),

    #[error("'{id}' has an invalid version: {reason}")]
    InvalidVersion { id: String, reason: String },
}

/// Calling a primitive from the wrong execution mode
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeError {
    #[error("node-mode primitive called while in DON mode")]
    NodeModeCallInDonMode,

    #[error("DON-mode primitive called while in node mode")]
    DonModeCallInNodeMode,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Workflow must have exactly one trigger, found {0}")]
    TriggerCount(usize),

    #[error("Step '{step_ref}' references unknown step '{referenced}'")]
    UnknownReference { step_ref: String, referenced: String },

    #[error("Step '{step_ref}' has malformed reference '{reference}'")]
    MalformedReference { step_ref: String, reference: String },

    #[error("Cyclic dependency detected")]
    CyclicDependency,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("capability {capability_id} failed: {source}")]
    Capability {
        capability_id: String,
        #[source]
        source: CapabilityError,
    },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Mode(#[from] ModeError),

    #[error("no mock or registered capability {capability_id} for step '{step_ref}'")]
    NoMock {
        step_ref: String,
        capability_id: String,
    },

    #[error("step '{step_ref}' cannot resolve '{reference}'")]
    UnresolvedReference { step_ref: String, reference: String },

    #[error("step '{step_ref}' has invalid inputs: {reason}")]
    InvalidInputs { step_ref: String, reason: String },

    #[error("no consensus under {policy} policy: {reason}")]
    NoConsensus { policy: &'static str, reason: String },

    #[error("trigger {trigger_id} closed before emitting an event")]
    TriggerClosed { trigger_id: String },
}

impl ExecutionError {
    pub fn capability(capability_id: impl Into<String>, source: CapabilityError) -> Self {
        ExecutionError::Capability {
            capability_id: capability_id.into(),
            source,
        }
    }

    pub fn is_mode_error(&self) -> bool {
        matches!(self, ExecutionError::Mode(_))
    }
}
