//! Core abstractions for the workflow engine
//!
//! This crate provides the data model shared by every other component:
//! the dynamic value tree, capability identities and traits, step and
//! workflow definitions, output references, errors and execution events.
//! It contains no execution logic.

mod capability;
mod error;
pub mod events;
pub mod reference;
mod value;
mod workflow;

pub use capability::{
    BaseCapability, Capability, CapabilityId, CapabilityInfo, CapabilityRequest,
    CapabilityType, ExecutableCapability, RequestMetadata, TriggerCapability, TriggerEvent,
    TriggerRegistrationRequest,
};
pub use error::{
    CapabilityError, CompileError, CompileErrors, ExecutionError, FlowError, IdError,
    ModeError, RegistryError, ResolutionError, WorkflowError,
};
pub use events::*;
pub use reference::{OutputRef, Template};
pub use value::{Value, ValueMap};
pub use workflow::{StepDefinition, StepInputs, StepOutputs, WorkflowSpec};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
