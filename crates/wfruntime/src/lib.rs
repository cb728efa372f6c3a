//! Workflow execution runtime
//!
//! This crate holds the capability registry, the workflow compiler and
//! dependency graph, and the runner that walks a compiled workflow. The
//! DON/node mode runtime and consensus policies live here as well.

mod compiler;
mod consensus;
mod executor;
mod graph;
mod promise;
mod registry;
mod runtime;

pub use compiler::{NewWorkflowParams, WorkflowSpecFactory};
pub use consensus::{Aggregation, ConsensusPolicy, Observation};
pub use executor::{ExecutionResult, NodeStep, ResultsTable, RunFailure, RunReport, Runner};
pub use graph::{DependencyGraph, GraphStep};
pub use promise::{Promise, Settled};
pub use registry::{CapabilityRegistry, DEFAULT_CHANNEL_CAPACITY};
pub use runtime::{DonRuntime, Mode, NodeRuntime, RuntimeConfig};
