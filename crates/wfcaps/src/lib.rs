//! Standard capability library
//!
//! Built-in triggers, actions and targets, plus the mock capability used to
//! stand in for real capabilities in tests.

mod debug;
mod mock;
mod transform;
mod trigger;

pub use debug::LogTarget;
pub use mock::MockCapability;
pub use transform::PassthroughAction;
pub use trigger::{ManualTrigger, StaticTrigger};

use std::sync::Arc;
use wfcore::Capability;

/// One instance of every standard capability, ready to add to a registry
pub fn standard_capabilities() -> Vec<Capability> {
    vec![
        Capability::trigger(Arc::new(StaticTrigger::default())),
        Capability::executable(Arc::new(PassthroughAction::default())),
        Capability::executable(Arc::new(LogTarget::default())),
    ]
}
